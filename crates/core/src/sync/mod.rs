//! Sync domain: queue, journal, engine, conflict resolution and remote contract.

mod conflict_resolver;
mod cursor_store;
mod journal;
mod remote;
mod retry_policy;
mod scheduler;
mod sync_engine;
mod sync_model;
mod sync_queue;

#[cfg(test)]
pub(crate) mod test_support;

pub use conflict_resolver::{ConflictResolution, ConflictResolver};
pub use cursor_store::{CursorStore, MemoryCursorStore};
pub use journal::{CompensatingWriter, Journal, JournalWriter, StoreWrite};
pub use remote::*;
pub use retry_policy::*;
pub use scheduler::*;
pub use sync_engine::{NoOpSyncTrigger, SyncEngine, SyncTrigger};
pub use sync_model::*;
pub use sync_queue::{merge_into, plan_enqueue, MemorySyncQueue, MergePlan, SyncQueue};
