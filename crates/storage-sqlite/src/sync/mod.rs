//! SQLite storage for the sync queue, failed items, pull cursors and the
//! transactional journal writer.

mod cursor_repository;
mod journal_writer;
pub mod model;
mod queue_repository;

pub use cursor_repository::SqliteCursorStore;
pub use journal_writer::SqliteJournalWriter;
pub use queue_repository::SqliteSyncQueue;
