use std::sync::Arc;

use diesel::Connection;

use pawkit_core::sync::{EnqueueRequest, JournalWriter, StoreWrite};
use pawkit_core::Result;

use super::queue_repository::enqueue_in;
use crate::db::get_connection;
use crate::entities::SqliteLocalStore;
use crate::errors::StorageError;

/// Commits an entity row and its queue intents in one SQLite transaction.
///
/// The sync queue must live in the same database as the store.
pub struct SqliteJournalWriter {
    store: Arc<SqliteLocalStore>,
}

impl SqliteJournalWriter {
    pub fn new(store: Arc<SqliteLocalStore>) -> Self {
        Self { store }
    }
}

impl JournalWriter for SqliteJournalWriter {
    fn apply(&self, write: StoreWrite, intents: Vec<EnqueueRequest>) -> Result<()> {
        let mut conn = get_connection(self.store.pool())?;
        conn.immediate_transaction::<_, StorageError, _>(|tx| {
            match &write {
                StoreWrite::Put(entity) => SqliteLocalStore::write(tx, entity)?,
                StoreWrite::Remove(entity) => {
                    SqliteLocalStore::remove(tx, entity)?;
                }
            }
            for intent in intents {
                enqueue_in(tx, intent)?;
            }
            Ok(())
        })?;

        match &write {
            StoreWrite::Put(entity) => self.store.notifier().upserted(entity),
            StoreWrite::Remove(entity) => self.store.notifier().removed(entity),
        }
        Ok(())
    }
}
