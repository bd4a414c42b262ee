//! Couples every local write with its sync-queue intent.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::{Map, Value};

use super::sync_model::{EnqueueRequest, LocalOnlyFields, SyncOperation};
use super::sync_queue::SyncQueue;
use crate::entities::Entity;
use crate::errors::Result;
use crate::store::LocalStore;

/// Store side of one journaled mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Put(Entity),
    /// Hard removal of the row for this entity.
    Remove(Entity),
}

impl StoreWrite {
    pub fn entity(&self) -> &Entity {
        match self {
            StoreWrite::Put(entity) | StoreWrite::Remove(entity) => entity,
        }
    }
}

/// Applies a store write and its queue intents as one unit.
///
/// Either the row change and every intent land, or none of them do.
pub trait JournalWriter: Send + Sync {
    fn apply(&self, write: StoreWrite, intents: Vec<EnqueueRequest>) -> Result<()>;
}

/// Writer over independent store and queue backends.
///
/// A failed enqueue restores the row as it was before the write.
pub struct CompensatingWriter {
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn SyncQueue>,
}

impl CompensatingWriter {
    pub fn new(store: Arc<dyn LocalStore>, queue: Arc<dyn SyncQueue>) -> Self {
        Self { store, queue }
    }

    fn restore(&self, id: &str, previous: Option<Entity>) -> Result<()> {
        match previous {
            Some(previous) => self.store.put(previous),
            None => self.store.delete(id),
        }
    }
}

impl JournalWriter for CompensatingWriter {
    fn apply(&self, write: StoreWrite, intents: Vec<EnqueueRequest>) -> Result<()> {
        let id = write.entity().id.clone();
        let previous = self.store.get(&id)?;
        match write {
            StoreWrite::Put(entity) => self.store.put(entity)?,
            StoreWrite::Remove(_) => self.store.delete(&id)?,
        }
        for intent in intents {
            if let Err(err) = self.queue.enqueue(intent) {
                warn!("[Journal] Enqueue for {} failed, restoring row: {}", id, err);
                if let Err(restore_err) = self.restore(&id, previous) {
                    warn!("[Journal] Failed to restore {}: {}", id, restore_err);
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Writes entities and enqueues the matching mutation.
///
/// Callers hold the `WriteGate` so concurrent writers never interleave.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn SyncQueue>,
    writer: Arc<dyn JournalWriter>,
    local_only_fields: LocalOnlyFields,
}

impl Journal {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn SyncQueue>,
        local_only_fields: LocalOnlyFields,
    ) -> Self {
        Self {
            writer: Arc::new(CompensatingWriter::new(store.clone(), queue.clone())),
            store,
            queue,
            local_only_fields,
        }
    }

    /// Replaces the default writer, e.g. with one sharing a database transaction.
    pub fn with_writer(mut self, writer: Arc<dyn JournalWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn SyncQueue> {
        &self.queue
    }

    pub fn local_only_fields(&self) -> &LocalOnlyFields {
        &self.local_only_fields
    }

    fn intent(
        &self,
        entity: &Entity,
        operation: SyncOperation,
        payload: Map<String, Value>,
    ) -> EnqueueRequest {
        let skip = operation == SyncOperation::Update && self.local_only_fields.covers(&payload);
        EnqueueRequest::new(entity.entity_type(), entity.id.clone(), operation, payload)
            .with_skip_conflict_check(skip)
    }

    /// Stores a new entity; local-only entities never enter the queue.
    pub fn record_create(&self, entity: Entity) -> Result<Entity> {
        let intents = if entity.is_local_only() {
            Vec::new()
        } else {
            vec![self.intent(&entity, SyncOperation::Create, entity.to_remote_json()?)]
        };
        self.writer.apply(StoreWrite::Put(entity.clone()), intents)?;
        Ok(entity)
    }

    /// Stores `after` and enqueues what changed since `before`.
    ///
    /// A flip of the local-only boundary is journaled as a `delete` + `create`
    /// pair so the remote holds the entity entirely or not at all.
    pub fn record_update(&self, before: &Entity, after: Entity) -> Result<Entity> {
        let changed = Entity::diff(before, &after)?;
        if changed.is_empty() {
            debug!("[Journal] {} {} unchanged", after.entity_type(), after.id);
            return Ok(after);
        }

        let intents = if before.is_local_only() != after.is_local_only() {
            debug!(
                "[Journal] {} {} crossed the local-only boundary ({} -> {})",
                after.entity_type(),
                after.id,
                before.is_local_only(),
                after.is_local_only()
            );
            vec![
                self.intent(&after, SyncOperation::Delete, Map::new()),
                self.intent(&after, SyncOperation::Create, after.to_remote_json()?),
            ]
        } else if !after.is_local_only() {
            vec![self.intent(&after, SyncOperation::Update, changed)]
        } else {
            Vec::new()
        };
        self.writer.apply(StoreWrite::Put(after.clone()), intents)?;
        Ok(after)
    }

    /// Soft delete. Always journaled; the remote treats deletes idempotently.
    pub fn record_delete(&self, entity: Entity) -> Result<Entity> {
        let intents = vec![self.intent(&entity, SyncOperation::Delete, Map::new())];
        self.writer.apply(StoreWrite::Put(entity.clone()), intents)?;
        Ok(entity)
    }

    /// Hard removal plus an irreversible `permanent-delete`.
    pub fn record_purge(&self, entity: &Entity) -> Result<()> {
        let intents = vec![self.intent(entity, SyncOperation::PermanentDelete, Map::new())];
        self.writer.apply(StoreWrite::Remove(entity.clone()), intents)
    }
}
