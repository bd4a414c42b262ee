//! Remote contract consumed by the sync engine.
//!
//! Protocol agnostic: `pawkit-device-sync` implements it over REST, tests
//! implement it in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::sync_model::SyncOperation;
use crate::entities::{Entity, EntityType};
use crate::errors::Result;

/// One queued mutation, ready to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    /// Full remote body for creates, changed fields for updates, empty for deletes.
    pub body: Map<String, Value>,
    /// Last-known server version. `None` when the version check is skipped.
    pub expected_version: Option<i64>,
}

/// Remote verdict on a pushed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Applied. Deletes may not report a version.
    Accepted { version: Option<i64> },
    /// `expected_version` was stale; the server's current copy is attached.
    Conflict { server: Box<Entity> },
    /// Refused for good (validation, schema, ...). Never retried automatically.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub entity_type: EntityType,
    pub workspace_id: String,
    /// Opaque cursor from the previous pull; `None` pulls everything.
    pub since: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Entities changed since the cursor, soft-deleted ones included.
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Ids permanently deleted since the cursor.
    #[serde(default)]
    pub removed: Vec<String>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Change pushed by the optional realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upserted(Box<Entity>),
    Removed { entity_type: EntityType, id: String },
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Errors: `TransientNetwork` (retry with backoff) or `PermanentRejection`.
    async fn push(&self, request: PushRequest) -> Result<PushOutcome>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;
}
