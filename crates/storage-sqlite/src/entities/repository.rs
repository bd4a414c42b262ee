use std::sync::Arc;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use tokio::sync::broadcast;

use pawkit_core::entities::{Entity, EntityType};
use pawkit_core::store::{ChangeNotifier, LocalStore, StoreChange};
use pawkit_core::Result;

use crate::db::{get_connection, DbPool};
use crate::errors::StorageError;

/// Runs `$body` with `$table` bound to the schema module of the entity type.
macro_rules! with_entity_table {
    ($entity_type:expr, $table:ident => $body:expr) => {
        match $entity_type {
            EntityType::Card => {
                use crate::schema::cards as $table;
                $body
            }
            EntityType::Collection => {
                use crate::schema::collections as $table;
                $body
            }
            EntityType::Event => {
                use crate::schema::events as $table;
                $body
            }
            EntityType::Reference => {
                use crate::schema::entity_references as $table;
                $body
            }
        }
    };
}

/// `LocalStore` over SQLite, one table per entity type.
///
/// Indexed envelope columns sit next to the full entity document in `data`.
pub struct SqliteLocalStore {
    pool: Arc<DbPool>,
    notifier: ChangeNotifier,
}

impl SqliteLocalStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self {
            pool,
            notifier: ChangeNotifier::new(),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub(crate) fn find(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> std::result::Result<Option<Entity>, StorageError> {
        for entity_type in EntityType::ALL {
            let data = with_entity_table!(entity_type, t => t::table
                .find(id)
                .select(t::data)
                .first::<String>(conn)
                .optional())?;
            if let Some(data) = data {
                return Ok(Some(serde_json::from_str(&data)?));
            }
        }
        Ok(None)
    }

    pub(crate) fn write(
        conn: &mut SqliteConnection,
        entity: &Entity,
    ) -> std::result::Result<(), StorageError> {
        let data = serde_json::to_string(entity)?;
        let updated_at = entity.updated_at.to_rfc3339();
        with_entity_table!(entity.entity_type(), t => diesel::insert_into(t::table)
            .values((
                t::id.eq(&entity.id),
                t::workspace_id.eq(&entity.workspace_id),
                t::version.eq(entity.version),
                t::deleted.eq(entity.deleted),
                t::updated_at.eq(&updated_at),
                t::data.eq(&data),
            ))
            .on_conflict(t::id)
            .do_update()
            .set((
                t::workspace_id.eq(&entity.workspace_id),
                t::version.eq(entity.version),
                t::deleted.eq(entity.deleted),
                t::updated_at.eq(&updated_at),
                t::data.eq(&data),
            ))
            .execute(conn))?;
        Ok(())
    }

    pub(crate) fn remove(
        conn: &mut SqliteConnection,
        entity: &Entity,
    ) -> std::result::Result<usize, StorageError> {
        let removed = with_entity_table!(entity.entity_type(), t =>
            diesel::delete(t::table.find(&entity.id)).execute(conn))?;
        Ok(removed)
    }

    fn load(
        conn: &mut SqliteConnection,
        workspace_id: &str,
        entity_type: EntityType,
        live_only: bool,
    ) -> std::result::Result<Vec<Entity>, StorageError> {
        let rows = with_entity_table!(entity_type, t => {
            let mut query = t::table
                .filter(t::workspace_id.eq(workspace_id))
                .select(t::data)
                .into_boxed();
            if live_only {
                query = query.filter(t::deleted.eq(false));
            }
            query.order(t::id.asc()).load::<String>(conn)
        })?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StorageError::from))
            .collect()
    }
}

impl LocalStore for SqliteLocalStore {
    fn get(&self, id: &str) -> Result<Option<Entity>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(Self::find(&mut conn, id)?)
    }

    fn put(&self, entity: Entity) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        Self::write(&mut conn, &entity)?;
        self.notifier.upserted(&entity);
        Ok(())
    }

    fn query(
        &self,
        workspace_id: &str,
        predicate: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>> {
        let mut conn = get_connection(&self.pool)?;
        let mut found = Vec::new();
        for entity_type in EntityType::ALL {
            found.extend(
                Self::load(&mut conn, workspace_id, entity_type, false)?
                    .into_iter()
                    .filter(|entity| predicate(entity)),
            );
        }
        Ok(found)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        let Some(entity) = Self::find(&mut conn, id)? else {
            return Ok(());
        };
        Self::remove(&mut conn, &entity)?;
        debug!("[Storage] Hard-deleted {} {}", entity.entity_type(), id);
        self.notifier.removed(&entity);
        Ok(())
    }

    fn update(&self, id: &str, apply: &mut dyn FnMut(&mut Entity)) -> Result<Option<Entity>> {
        let mut conn = get_connection(&self.pool)?;
        let updated = conn.immediate_transaction::<_, StorageError, _>(|tx| {
            let Some(mut entity) = Self::find(tx, id)? else {
                return Ok(None);
            };
            apply(&mut entity);
            Self::write(tx, &entity)?;
            Ok(Some(entity))
        })?;
        if let Some(entity) = &updated {
            self.notifier.upserted(entity);
        }
        Ok(updated)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.notifier.subscribe()
    }

    fn list_live(&self, workspace_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(Self::load(&mut conn, workspace_id, entity_type, true)?)
    }
}
