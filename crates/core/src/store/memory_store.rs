use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;

use super::{ChangeNotifier, LocalStore, StoreChange};
use crate::entities::Entity;
use crate::errors::{DatabaseError, Result};

fn poisoned() -> DatabaseError {
    DatabaseError::Internal("Memory store lock is poisoned".to_string())
}

/// In-process `LocalStore` used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Entity>>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Entity>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(id).cloned())
    }

    fn put(&self, entity: Entity) -> Result<()> {
        {
            let mut records = self.records.write().map_err(|_| poisoned())?;
            records.insert(entity.id.clone(), entity.clone());
        }
        self.notifier.upserted(&entity);
        Ok(())
    }

    fn query(
        &self,
        workspace_id: &str,
        predicate: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .values()
            .filter(|entity| entity.workspace_id == workspace_id && predicate(entity))
            .cloned()
            .collect())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let removed = {
            let mut records = self.records.write().map_err(|_| poisoned())?;
            records.remove(id)
        };
        if let Some(entity) = removed {
            self.notifier.removed(&entity);
        }
        Ok(())
    }

    fn update(&self, id: &str, apply: &mut dyn FnMut(&mut Entity)) -> Result<Option<Entity>> {
        let updated = {
            let mut records = self.records.write().map_err(|_| poisoned())?;
            match records.get_mut(id) {
                Some(entity) => {
                    apply(entity);
                    Some(entity.clone())
                }
                None => None,
            }
        };
        if let Some(entity) = &updated {
            self.notifier.upserted(entity);
        }
        Ok(updated)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CardFields, CardType, EntityBody, EntityType};
    use chrono::Utc;

    fn card(workspace: &str, title: &str) -> Entity {
        Entity::new(
            workspace,
            EntityBody::Card(CardFields::new(CardType::Note, title)),
            Utc::now(),
        )
    }

    #[test]
    fn put_get_and_hard_delete() {
        let store = MemoryStore::new();
        let entity = card("ws-1", "a");
        store.put(entity.clone()).expect("put");
        assert_eq!(store.get(&entity.id).expect("get"), Some(entity.clone()));

        store.delete(&entity.id).expect("delete");
        assert_eq!(store.get(&entity.id).expect("get"), None);
        store.delete(&entity.id).expect("deleting twice is a no-op");
    }

    #[test]
    fn query_is_scoped_to_workspace() {
        let store = MemoryStore::new();
        store.put(card("ws-1", "a")).expect("put");
        store.put(card("ws-2", "b")).expect("put");

        let found = store.query("ws-1", &|_| true).expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].workspace_id, "ws-1");
    }

    #[test]
    fn list_live_excludes_soft_deleted() {
        let store = MemoryStore::new();
        let mut deleted = card("ws-1", "gone");
        deleted.mark_deleted(Utc::now());
        store.put(deleted).expect("put");
        store.put(card("ws-1", "kept")).expect("put");

        let live = store.list_live("ws-1", EntityType::Card).expect("list");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].as_card().expect("card").title, "kept");
    }

    #[test]
    fn update_is_read_modify_write() {
        let store = MemoryStore::new();
        let entity = card("ws-1", "a");
        store.put(entity.clone()).expect("put");

        let updated = store
            .update(&entity.id, &mut |e| e.version = 7)
            .expect("update")
            .expect("exists");
        assert_eq!(updated.version, 7);
        assert!(store.update("missing", &mut |_| {}).expect("update").is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_writes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let entity = card("ws-1", "a");
        store.put(entity.clone()).expect("put");
        store.delete(&entity.id).expect("delete");

        match changes.recv().await.expect("upsert event") {
            StoreChange::Upserted { id, .. } => assert_eq!(id, entity.id),
            other => panic!("unexpected change {:?}", other),
        }
        match changes.recv().await.expect("remove event") {
            StoreChange::Removed { id, .. } => assert_eq!(id, entity.id),
            other => panic!("unexpected change {:?}", other),
        }
    }
}
