use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;

use pawkit_core::entities::EntityType;
use pawkit_core::sync::CursorStore;
use pawkit_core::Result;

use super::model::SyncCursorDB;
use crate::db::{get_connection, DbPool};
use crate::errors::StorageError;
use crate::schema::sync_cursors;

pub struct SqliteCursorStore {
    pool: Arc<DbPool>,
}

impl SqliteCursorStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

impl CursorStore for SqliteCursorStore {
    fn get_cursor(&self, workspace_id: &str, entity_type: EntityType) -> Result<Option<String>> {
        let mut conn = get_connection(&self.pool)?;
        let cursor = sync_cursors::table
            .find((workspace_id, entity_type.as_str()))
            .select(sync_cursors::cursor)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(cursor)
    }

    fn set_cursor(&self, workspace_id: &str, entity_type: EntityType, cursor: &str) -> Result<()> {
        let row = SyncCursorDB {
            workspace_id: workspace_id.to_string(),
            entity_type: entity_type.as_str().to_string(),
            cursor: cursor.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let mut conn = get_connection(&self.pool)?;
        diesel::insert_into(sync_cursors::table)
            .values(&row)
            .on_conflict((sync_cursors::workspace_id, sync_cursors::entity_type))
            .do_update()
            .set((
                sync_cursors::cursor.eq(&row.cursor),
                sync_cursors::updated_at.eq(&row.updated_at),
            ))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }
}
