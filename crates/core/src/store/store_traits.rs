use tokio::sync::broadcast;

use crate::entities::{Entity, EntityType};
use crate::errors::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Read-model change emitted after every committed store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted {
        entity_type: EntityType,
        workspace_id: String,
        id: String,
    },
    Removed {
        entity_type: EntityType,
        workspace_id: String,
        id: String,
    },
}

impl StoreChange {
    pub fn id(&self) -> &str {
        match self {
            StoreChange::Upserted { id, .. } | StoreChange::Removed { id, .. } => id,
        }
    }
}

/// Fan-out of store changes to the rendering layer. Sends never block and are
/// dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    pub fn upserted(&self, entity: &Entity) {
        let _ = self.sender.send(StoreChange::Upserted {
            entity_type: entity.entity_type(),
            workspace_id: entity.workspace_id.clone(),
            id: entity.id.clone(),
        });
    }

    pub fn removed(&self, entity: &Entity) {
        let _ = self.sender.send(StoreChange::Removed {
            entity_type: entity.entity_type(),
            workspace_id: entity.workspace_id.clone(),
            id: entity.id.clone(),
        });
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Key-value record store for entities.
///
/// Writes are atomic per key. The store never validates cross-entity
/// invariants; callers (the tag cascade, the library service) own those.
pub trait LocalStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// Inserts or replaces the entity keyed by its id.
    fn put(&self, entity: Entity) -> Result<()>;

    /// Unordered scan of one workspace, soft-deleted rows included.
    fn query(&self, workspace_id: &str, predicate: &dyn Fn(&Entity) -> bool)
        -> Result<Vec<Entity>>;

    /// Hard delete. Missing ids are a no-op.
    fn delete(&self, id: &str) -> Result<()>;

    /// Atomic read-modify-write of a single record. Returns the stored result,
    /// or `None` when the id does not exist.
    fn update(&self, id: &str, apply: &mut dyn FnMut(&mut Entity)) -> Result<Option<Entity>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    fn get_required(&self, id: &str) -> Result<Entity> {
        self.get(id)?
            .ok_or_else(|| Error::not_found(format!("entity {}", id)))
    }

    /// Live (not soft-deleted) entities of one type.
    fn list_live(&self, workspace_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.query(workspace_id, &|entity| {
            !entity.deleted && entity.entity_type() == entity_type
        })
    }
}
