//! Error taxonomy shared by the Pawkit crates.

use thiserror::Error;

/// Result alias used across the core crate and its storage/client adapters.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level failures surfaced by `LocalStore`/`SyncQueue` implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Mutation target missing locally.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote rejected a write because the expected version was stale.
    #[error("Version conflict on {entity_id}: local v{local_version}, remote v{remote_version}")]
    VersionConflict {
        entity_id: String,
        local_version: i64,
        remote_version: i64,
    },

    /// Network-level failure; the queue entry is preserved and retried with backoff.
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// Remote refused the write for good (validation, schema, ...).
    #[error("Rejected by remote: {0}")]
    PermanentRejection(String),

    /// A mutation would break a local invariant. Nothing was written.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::PermanentRejection(message.into())
    }

    /// True for failures the engine retries with backoff instead of dropping.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}
