//! Database models for the sync queue, failed items and pull cursors.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use pawkit_core::entities::EntityType;
use pawkit_core::sync::{EnqueueRequest, FailedItem, FailureClass, QueueEntry, SyncOperation};

use crate::errors::StorageError;

#[derive(Queryable, Identifiable, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(primary_key(seq))]
#[diesel(table_name = crate::schema::sync_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncQueueEntryDB {
    pub seq: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub skip_conflict_check: bool,
    pub enqueued_at: String,
    pub attempts: i32,
    pub in_flight: bool,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_queue)]
pub struct NewSyncQueueEntryDB {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub skip_conflict_check: bool,
    pub enqueued_at: String,
    pub attempts: i32,
    pub in_flight: bool,
}

impl NewSyncQueueEntryDB {
    pub fn from_request(
        request: &EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            entity_type: request.entity_type.as_str().to_string(),
            entity_id: request.entity_id.clone(),
            operation: request.operation.as_str().to_string(),
            payload: serde_json::to_string(&request.payload)?,
            skip_conflict_check: request.skip_conflict_check
                && request.operation == SyncOperation::Update,
            enqueued_at: now.to_rfc3339(),
            attempts: 0,
            in_flight: false,
        })
    }
}

impl TryFrom<SyncQueueEntryDB> for QueueEntry {
    type Error = StorageError;

    fn try_from(row: SyncQueueEntryDB) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            seq: row.seq,
            entity_type: parse_entity_type(&row.entity_type)?,
            operation: SyncOperation::parse(&row.operation).ok_or_else(|| {
                StorageError::InvalidRow(format!(
                    "queue entry {} has unknown operation '{}'",
                    row.seq, row.operation
                ))
            })?,
            payload: serde_json::from_str(&row.payload)?,
            skip_conflict_check: row.skip_conflict_check,
            enqueued_at: parse_timestamp(&row.enqueued_at)?,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            in_flight: row.in_flight,
            entity_id: row.entity_id,
        })
    }
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_failures)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncFailureDB {
    pub id: i64,
    pub entry: String,
    pub reason: String,
    pub class: String,
    pub failed_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_failures)]
pub struct NewSyncFailureDB {
    pub entry: String,
    pub reason: String,
    pub class: String,
    pub failed_at: String,
}

impl TryFrom<SyncFailureDB> for FailedItem {
    type Error = StorageError;

    fn try_from(row: SyncFailureDB) -> Result<Self, Self::Error> {
        Ok(FailedItem {
            id: row.id,
            entry: serde_json::from_str(&row.entry)?,
            class: FailureClass::parse(&row.class).ok_or_else(|| {
                StorageError::InvalidRow(format!(
                    "failed item {} has unknown class '{}'",
                    row.id, row.class
                ))
            })?,
            failed_at: parse_timestamp(&row.failed_at)?,
            reason: row.reason,
        })
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(workspace_id, entity_type))]
#[diesel(table_name = crate::schema::sync_cursors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCursorDB {
    pub workspace_id: String,
    pub entity_type: String,
    pub cursor: String,
    pub updated_at: String,
}

pub fn parse_entity_type(value: &str) -> Result<EntityType, StorageError> {
    EntityType::parse(value)
        .ok_or_else(|| StorageError::InvalidRow(format!("unknown entity type '{}'", value)))
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow(format!("invalid timestamp '{}': {}", value, e)))
}
