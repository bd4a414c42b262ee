//! Wire types for the entity sync API.

use pawkit_core::entities::{Entity, EntityType};
use serde::{Deserialize, Serialize};

/// Error body returned by the API on failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    pub code: String,
    pub message: String,
}

/// Acknowledgement of a create, update or delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Body of a `409 Conflict` answer to a stale `expectedVersion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub server_entity: Entity,
}

/// Path segment of the remote collection holding one entity type.
pub fn resource_name(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Card => "cards",
        EntityType::Collection => "collections",
        EntityType::Event => "events",
        EntityType::Reference => "references",
    }
}
