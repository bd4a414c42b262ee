//! SQLite persistence for Pawkit: entity tables, the durable sync queue and
//! pull cursors, all behind an r2d2 pool with embedded diesel migrations.

pub mod db;
pub mod entities;
pub mod errors;
pub mod schema;
pub mod sync;

pub use db::{create_pool, get_connection, init, run_migrations, DbPool};
pub use entities::SqliteLocalStore;
pub use errors::StorageError;
pub use sync::{SqliteCursorStore, SqliteJournalWriter, SqliteSyncQueue};
