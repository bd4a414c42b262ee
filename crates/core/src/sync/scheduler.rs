//! Scheduler constants for the background sync loop.

/// Periodic pull cadence in seconds.
pub const SYNC_FOREGROUND_INTERVAL_SECS: u64 = 45;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// First retry delay after a network failure.
pub const SYNC_BACKOFF_BASE_SECS: u64 = 5;

/// Backoff stops growing after this many consecutive failures.
pub const SYNC_BACKOFF_MAX_EXPONENT: u32 = 8;

/// Entries handed to the engine per dequeue.
pub const SYNC_DEFAULT_BATCH_SIZE: usize = 100;

/// Push attempts before an entry is parked in the failed-items list.
pub const SYNC_DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Soft-deleted entities are purged after this many days.
pub const TRASH_RETENTION_DAYS: i64 = 30;
