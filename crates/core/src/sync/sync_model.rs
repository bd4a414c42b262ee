//! Sync queue, status and failure models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::EntityType;

/// Default allowlist of presentation/organizational fields that never need a
/// version check on push.
pub const DEFAULT_LOCAL_ONLY_FIELDS: [&str; 5] = [
    "tags",
    "pinned",
    "readProgress",
    "lastOpenedAt",
    "conflictWithId",
];

/// Queued mutation kinds, in the remote's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    PermanentDelete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
            SyncOperation::PermanentDelete => "permanent-delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(SyncOperation::Create),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            "permanent-delete" => Some(SyncOperation::PermanentDelete),
            _ => None,
        }
    }
}

/// Field classification deciding whether an update may skip the version check.
///
/// Injected through configuration; the set is a product decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOnlyFields(BTreeSet<String>);

impl LocalOnlyFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains(field)
    }

    /// True when every changed field is local-only. Empty payloads never skip.
    pub fn covers(&self, payload: &Map<String, Value>) -> bool {
        !payload.is_empty() && payload.keys().all(|key| self.contains(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for LocalOnlyFields {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_ONLY_FIELDS)
    }
}

/// Request to append a mutation to the sync queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: Map<String, Value>,
    pub skip_conflict_check: bool,
}

impl EnqueueRequest {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: SyncOperation,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            skip_conflict_check: false,
        }
    }

    pub fn with_skip_conflict_check(mut self, skip: bool) -> Self {
        self.skip_conflict_check = skip;
        self
    }
}

/// A pending mutation in the durable intent log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Monotonic sequence number preserving enqueue order.
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: Map<String, Value>,
    pub skip_conflict_check: bool,
    pub enqueued_at: DateTime<Utc>,
    /// Failed push attempts so far.
    pub attempts: u32,
    /// Handed to the engine by `dequeue_batch` and not yet dropped or requeued.
    /// Producers never merge into an in-flight entry.
    pub in_flight: bool,
}

/// Whether a dropped entry may be retried by `retry_failed_items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(FailureClass::Transient),
            "permanent" => Some(FailureClass::Permanent),
            _ => None,
        }
    }
}

/// A queue entry that left the queue without being applied remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub id: i64,
    pub entry: QueueEntry,
    pub reason: String,
    pub class: FailureClass,
    pub failed_at: DateTime<Utc>,
}

/// Per-cycle state machine of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Draining,
    Pushing,
    Pulling,
    Reconciling,
    /// Entered on network failure, left on backoff expiry or connectivity recovery.
    Offline,
}

/// Coarse status exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Offline,
}

impl From<SyncPhase> for SyncStatus {
    fn from(phase: SyncPhase) -> Self {
        match phase {
            SyncPhase::Idle => SyncStatus::Idle,
            SyncPhase::Offline => SyncStatus::Offline,
            SyncPhase::Draining
            | SyncPhase::Pushing
            | SyncPhase::Pulling
            | SyncPhase::Reconciling => SyncStatus::Syncing,
        }
    }
}

/// Trigger source for sync cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    LocalMutation,
    Periodic,
    ConnectivityRestored,
    Manual,
}

/// Lightweight cycle metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleMetrics {
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub conflict_count: usize,
    pub rejected_count: usize,
    pub duration_ms: i64,
    pub status: String,
}

/// Snapshot published on every phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<SyncCycleMetrics>,
}

impl Default for SyncStatusSnapshot {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            phase: SyncPhase::Idle,
            pending_count: 0,
            failed_count: 0,
            last_error: None,
            consecutive_failures: 0,
            last_sync_at: None,
            last_cycle: None,
        }
    }
}
