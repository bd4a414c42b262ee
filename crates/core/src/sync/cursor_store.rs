use std::collections::HashMap;
use std::sync::Mutex;

use crate::entities::EntityType;
use crate::errors::{DatabaseError, Result};

/// Persisted pull cursors, one per `(workspace, entity type)`.
pub trait CursorStore: Send + Sync {
    fn get_cursor(&self, workspace_id: &str, entity_type: EntityType) -> Result<Option<String>>;

    fn set_cursor(&self, workspace_id: &str, entity_type: EntityType, cursor: &str)
        -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<(String, EntityType), String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn get_cursor(&self, workspace_id: &str, entity_type: EntityType) -> Result<Option<String>> {
        let cursors = self.cursors.lock().map_err(|_| {
            DatabaseError::Internal("Cursor store lock is poisoned".to_string())
        })?;
        Ok(cursors
            .get(&(workspace_id.to_string(), entity_type))
            .cloned())
    }

    fn set_cursor(
        &self,
        workspace_id: &str,
        entity_type: EntityType,
        cursor: &str,
    ) -> Result<()> {
        let mut cursors = self.cursors.lock().map_err(|_| {
            DatabaseError::Internal("Cursor store lock is poisoned".to_string())
        })?;
        cursors.insert((workspace_id.to_string(), entity_type), cursor.to_string());
        Ok(())
    }
}
