//! Sync Queue: durable, ordered journal of pending mutations.
//!
//! Enqueue collapses redundant intent per `(entity type, id)`:
//! - `update` after a pending `create`/`update` shallow-merges into it,
//! - `delete` discards pending `create`/`update` entries and coalesces with a
//!   pending `delete`,
//! - `permanent-delete` discards everything still pending for the entity.
//!
//! Entries handed out by `dequeue_batch` are flagged in-flight; producers append
//! instead of merging into them, so a racing enqueue is never lost when the
//! engine drops the entry it pushed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use log::debug;

use super::sync_model::{EnqueueRequest, FailedItem, FailureClass, QueueEntry, SyncOperation};
use crate::entities::EntityType;
use crate::errors::{DatabaseError, Result};

/// How an enqueue request folds into the entity's pending entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePlan {
    /// Add a new entry at the tail.
    Append,
    /// Shallow-merge the payload into the pending entry `seq`.
    MergeInto { seq: i64 },
    /// Remove `discard`, then append a new entry unless `coalesce_with` already
    /// expresses the request.
    Replace {
        discard: Vec<i64>,
        coalesce_with: Option<i64>,
    },
}

/// Decides how `request` folds into `pending`, the entity's entries in enqueue order.
pub fn plan_enqueue(pending: &[QueueEntry], request: &EnqueueRequest) -> MergePlan {
    let last = pending.last();
    match request.operation {
        SyncOperation::Update => match last {
            Some(entry)
                if !entry.in_flight
                    && matches!(entry.operation, SyncOperation::Create | SyncOperation::Update) =>
            {
                MergePlan::MergeInto { seq: entry.seq }
            }
            _ => MergePlan::Append,
        },
        SyncOperation::Create => match last {
            Some(entry) if !entry.in_flight && entry.operation == SyncOperation::Create => {
                MergePlan::MergeInto { seq: entry.seq }
            }
            _ => MergePlan::Append,
        },
        SyncOperation::Delete => {
            let discard: Vec<i64> = pending
                .iter()
                .filter(|entry| {
                    !entry.in_flight
                        && matches!(entry.operation, SyncOperation::Create | SyncOperation::Update)
                })
                .map(|entry| entry.seq)
                .collect();
            let coalesce_with = pending
                .iter()
                .filter(|entry| !discard.contains(&entry.seq))
                .last()
                .filter(|entry| !entry.in_flight && entry.operation == SyncOperation::Delete)
                .map(|entry| entry.seq);
            if discard.is_empty() && coalesce_with.is_none() {
                MergePlan::Append
            } else {
                MergePlan::Replace {
                    discard,
                    coalesce_with,
                }
            }
        }
        SyncOperation::PermanentDelete => {
            let discard: Vec<i64> = pending
                .iter()
                .filter(|entry| !entry.in_flight)
                .map(|entry| entry.seq)
                .collect();
            if discard.is_empty() {
                MergePlan::Append
            } else {
                MergePlan::Replace {
                    discard,
                    coalesce_with: None,
                }
            }
        }
    }
}

/// Folds `request` into an existing entry selected by `MergePlan::MergeInto`.
pub fn merge_into(entry: &mut QueueEntry, request: EnqueueRequest) {
    for (key, value) in request.payload {
        entry.payload.insert(key, value);
    }
    entry.skip_conflict_check = match entry.operation {
        SyncOperation::Update => entry.skip_conflict_check && request.skip_conflict_check,
        _ => false,
    };
}

/// Durable intent log consumed by the sync engine.
///
/// One producer (the library service) races one consumer (the engine).
pub trait SyncQueue: Send + Sync {
    /// Appends or merges a mutation. Returns the entry now holding the intent.
    fn enqueue(&self, request: EnqueueRequest) -> Result<QueueEntry>;

    /// Oldest pending entries in FIFO order, marked in-flight.
    fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueEntry>>;

    /// Removes an entry after it was applied (or abandoned).
    fn drop_entry(&self, seq: i64) -> Result<()>;

    /// Returns an in-flight entry to the pending state after a failed push.
    fn requeue(&self, seq: i64) -> Result<()>;

    /// Returns an in-flight entry untouched (cancelled push).
    fn release(&self, seq: i64) -> Result<()>;

    /// Removes every pending, not in-flight, entry for one entity.
    fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<usize>;

    /// True while any entry (in-flight included) exists for the entity.
    fn has_pending(&self, entity_type: EntityType, entity_id: &str) -> Result<bool>;

    fn pending_count(&self) -> Result<usize>;

    fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Resets entries left in-flight by an interrupted process.
    fn recover_in_flight(&self) -> Result<usize>;

    fn record_failure(&self, entry: QueueEntry, reason: String, class: FailureClass)
        -> Result<()>;

    fn list_failed(&self) -> Result<Vec<FailedItem>>;

    /// Removes and returns failed items of one class.
    fn take_failed(&self, class: FailureClass) -> Result<Vec<FailedItem>>;
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: i64,
    entries: BTreeMap<i64, QueueEntry>,
    failed: Vec<FailedItem>,
    next_failed_id: i64,
}

impl QueueState {
    fn entries_for(&self, entity_type: EntityType, entity_id: &str) -> Vec<QueueEntry> {
        self.entries
            .values()
            .filter(|entry| entry.entity_type == entity_type && entry.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn append(&mut self, request: EnqueueRequest) -> QueueEntry {
        self.next_seq += 1;
        let entry = QueueEntry {
            seq: self.next_seq,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            operation: request.operation,
            payload: request.payload,
            skip_conflict_check: request.skip_conflict_check
                && request.operation == SyncOperation::Update,
            enqueued_at: Utc::now(),
            attempts: 0,
            in_flight: false,
        };
        self.entries.insert(entry.seq, entry.clone());
        entry
    }
}

fn poisoned() -> DatabaseError {
    DatabaseError::Internal("Sync queue lock is poisoned".to_string())
}

/// In-process `SyncQueue`.
#[derive(Debug, Default)]
pub struct MemorySyncQueue {
    state: Mutex<QueueState>,
}

impl MemorySyncQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncQueue for MemorySyncQueue {
    fn enqueue(&self, request: EnqueueRequest) -> Result<QueueEntry> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let pending = state.entries_for(request.entity_type, &request.entity_id);
        let plan = plan_enqueue(&pending, &request);
        debug!(
            "[SyncQueue] enqueue {} {} {} -> {:?}",
            request.operation.as_str(),
            request.entity_type,
            request.entity_id,
            plan
        );

        match plan {
            MergePlan::Append => Ok(state.append(request)),
            MergePlan::MergeInto { seq } => match state.entries.get_mut(&seq) {
                Some(entry) => {
                    merge_into(entry, request);
                    Ok(entry.clone())
                }
                None => Ok(state.append(request)),
            },
            MergePlan::Replace {
                discard,
                coalesce_with,
            } => {
                for seq in discard {
                    state.entries.remove(&seq);
                }
                match coalesce_with.and_then(|seq| state.entries.get(&seq).cloned()) {
                    Some(existing) => Ok(existing),
                    None => Ok(state.append(request)),
                }
            }
        }
    }

    fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let mut batch = Vec::new();
        for entry in state.entries.values_mut() {
            if batch.len() >= limit {
                break;
            }
            if entry.in_flight {
                continue;
            }
            entry.in_flight = true;
            batch.push(entry.clone());
        }
        Ok(batch)
    }

    fn drop_entry(&self, seq: i64) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.entries.remove(&seq);
        Ok(())
    }

    fn requeue(&self, seq: i64) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(entry) = state.entries.get_mut(&seq) {
            entry.in_flight = false;
            entry.attempts += 1;
        }
        Ok(())
    }

    fn release(&self, seq: i64) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(entry) = state.entries.get_mut(&seq) {
            entry.in_flight = false;
        }
        Ok(())
    }

    fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<usize> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let before = state.entries.len();
        state.entries.retain(|_, entry| {
            entry.in_flight || entry.entity_type != entity_type || entry.entity_id != entity_id
        });
        Ok(before - state.entries.len())
    }

    fn has_pending(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state
            .entries
            .values()
            .any(|entry| entry.entity_type == entity_type && entry.entity_id == entity_id))
    }

    fn pending_count(&self) -> Result<usize> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.entries.len())
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.entries.values().cloned().collect())
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let mut recovered = 0;
        for entry in state.entries.values_mut().filter(|entry| entry.in_flight) {
            entry.in_flight = false;
            recovered += 1;
        }
        Ok(recovered)
    }

    fn record_failure(
        &self,
        mut entry: QueueEntry,
        reason: String,
        class: FailureClass,
    ) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.next_failed_id += 1;
        entry.in_flight = false;
        let item = FailedItem {
            id: state.next_failed_id,
            entry,
            reason,
            class,
            failed_at: Utc::now(),
        };
        state.failed.push(item);
        Ok(())
    }

    fn list_failed(&self) -> Result<Vec<FailedItem>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.failed.clone())
    }

    fn take_failed(&self, class: FailureClass) -> Result<Vec<FailedItem>> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let (taken, kept): (Vec<_>, Vec<_>) =
            state.failed.drain(..).partition(|item| item.class == class);
        state.failed = kept;
        Ok(taken)
    }
}
