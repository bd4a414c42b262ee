use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::collections::{validate_slug, TagCascadeManager};
use crate::entities::{
    CardFields, CollectionFields, Entity, EntityBody, EntityType, EventFields, ReferenceFields,
};
use crate::errors::{Error, Result};
use crate::store::{LocalStore, StoreChange, WriteGate};
use crate::sync::{ConflictResolver, Journal, NoOpSyncTrigger, SyncTrigger, TRASH_RETENTION_DAYS};

/// Local-first mutation API.
///
/// Every mutation is one atomic unit under the `WriteGate` (store write plus
/// queue enqueue) followed by a sync trigger. Missing targets are logged and
/// reported as `Ok(None)`; only invariant violations and storage failures
/// surface as errors.
pub struct LibraryService {
    journal: Journal,
    gate: WriteGate,
    cascade: TagCascadeManager,
    resolver: ConflictResolver,
    sync_trigger: Arc<dyn SyncTrigger>,
    trash_retention_days: i64,
}

/// Structural part of an update, validated before anything is written.
enum Structural {
    Collection(CollectionEdits),
    Private(bool),
    Plain,
}

#[derive(Debug, Default)]
struct CollectionEdits {
    slug: Option<String>,
    /// `Some(None)` moves the collection to the root.
    parent: Option<Option<String>>,
    local_only: Option<bool>,
    make_default: bool,
}

impl CollectionEdits {
    /// Pulls the structural keys out of `patch`, checking their types.
    fn take(id: &str, patch: &mut Map<String, Value>) -> Result<Self> {
        let mut edits = Self::default();
        if patch.remove("isSystem").is_some() {
            warn!("[Library] Ignoring isSystem change on collection {}", id);
        }
        if let Some(slug) = patch.remove("slug") {
            let slug = slug
                .as_str()
                .ok_or_else(|| Error::invariant("slug must be a string"))?;
            edits.slug = Some(slug.to_string());
        }
        if let Some(parent) = patch.remove("parentId") {
            edits.parent = Some(match parent {
                Value::Null => None,
                Value::String(parent_id) => Some(parent_id),
                _ => return Err(Error::invariant("parentId must be a string or null")),
            });
        }
        if let Some(local_only) = patch.remove("isLocalOnly") {
            edits.local_only = Some(
                local_only
                    .as_bool()
                    .ok_or_else(|| Error::invariant("isLocalOnly must be a boolean"))?,
            );
        }
        if let Some(is_default) = patch.remove("isDefault") {
            match is_default.as_bool() {
                Some(true) => edits.make_default = true,
                Some(false) => {
                    return Err(Error::invariant(
                        "Pick another default collection instead of unsetting it".to_string(),
                    ));
                }
                None => return Err(Error::invariant("isDefault must be a boolean")),
            }
        }
        Ok(edits)
    }
}

impl LibraryService {
    pub fn new(journal: Journal, gate: WriteGate) -> Self {
        Self {
            cascade: TagCascadeManager::new(journal.clone()),
            resolver: ConflictResolver::new(journal.clone()),
            journal,
            gate,
            sync_trigger: Arc::new(NoOpSyncTrigger),
            trash_retention_days: TRASH_RETENTION_DAYS,
        }
    }

    /// Sets the trigger woken after each committed mutation.
    pub fn with_sync_trigger(mut self, sync_trigger: Arc<dyn SyncTrigger>) -> Self {
        self.sync_trigger = sync_trigger;
        self
    }

    pub fn with_trash_retention_days(mut self, days: i64) -> Self {
        self.trash_retention_days = days;
        self
    }

    fn store(&self) -> &Arc<dyn LocalStore> {
        self.journal.store()
    }

    /// Runs `mutation` under the write gate and triggers sync when it wrote.
    fn commit<T>(&self, mutation: impl FnOnce() -> Result<Option<T>>) -> Result<Option<T>> {
        let result = {
            let _gate = self.gate.lock()?;
            mutation()?
        };
        if result.is_some() {
            self.sync_trigger.trigger();
        }
        Ok(result)
    }

    fn live(&self, id: &str) -> Result<Option<Entity>> {
        let entity = self.store().get(id)?.filter(|entity| !entity.deleted);
        if entity.is_none() {
            warn!("[Library] {} not found", id);
        }
        Ok(entity)
    }

    pub fn create_card(&self, workspace_id: &str, fields: CardFields) -> Result<Entity> {
        let created = self.commit(|| {
            let tree = self.cascade.tree(workspace_id)?;
            let mut card = Entity::new(workspace_id, EntityBody::Card(fields), Utc::now());
            self.cascade.normalize_card(&tree, &mut card);
            debug!(
                "[Library] Creating card {} (local-only: {})",
                card.id,
                card.is_local_only()
            );
            self.journal.record_create(card).map(Some)
        })?;
        created.ok_or_else(|| Error::Unexpected("Card creation produced nothing".to_string()))
    }

    /// Creates a collection. A child of a local-only collection is local-only too.
    pub fn create_collection(
        &self,
        workspace_id: &str,
        mut fields: CollectionFields,
    ) -> Result<Entity> {
        validate_slug(&fields.slug)?;
        let created = self.commit(|| {
            let tree = self.cascade.tree(workspace_id)?;
            if tree.by_slug(&fields.slug).is_some() {
                return Err(Error::invariant(format!(
                    "Slug '{}' is already used in this workspace",
                    fields.slug
                )));
            }
            if let Some(parent_id) = fields.parent_id.as_deref() {
                let parent = tree.get(parent_id).ok_or_else(|| {
                    Error::invariant(format!("Parent collection {} does not exist", parent_id))
                })?;
                fields.is_local_only |= parent.is_local_only;
            }
            if fields.is_local_only && (fields.is_default || fields.is_system) {
                return Err(Error::invariant(format!(
                    "Collection '{}' cannot be both local-only and default/system",
                    fields.slug
                )));
            }
            if fields.is_default {
                self.clear_default(workspace_id)?;
            }
            let collection =
                Entity::new(workspace_id, EntityBody::Collection(fields), Utc::now());
            self.journal.record_create(collection).map(Some)
        })?;
        created.ok_or_else(|| {
            Error::Unexpected("Collection creation produced nothing".to_string())
        })
    }

    pub fn create_event(&self, workspace_id: &str, fields: EventFields) -> Result<Entity> {
        self.create_plain(workspace_id, EntityBody::Event(fields))
    }

    pub fn create_reference(&self, workspace_id: &str, fields: ReferenceFields) -> Result<Entity> {
        self.create_plain(workspace_id, EntityBody::Reference(fields))
    }

    fn create_plain(&self, workspace_id: &str, body: EntityBody) -> Result<Entity> {
        let created = self.commit(|| {
            let entity = Entity::new(workspace_id, body, Utc::now());
            self.journal.record_create(entity).map(Some)
        })?;
        created.ok_or_else(|| Error::Unexpected("Entity creation produced nothing".to_string()))
    }

    /// Shallow-merges `patch` into a live entity.
    ///
    /// Structural collection fields (slug, parent, local-only, default) and the
    /// card privacy flag are routed through the tag cascade; card tags are
    /// closed over collection ancestors. Every invariant is checked before the
    /// first write, so a rejected patch leaves no trace.
    pub fn update_entity(&self, id: &str, patch: Map<String, Value>) -> Result<Option<Entity>> {
        self.commit(|| {
            let Some(current) = self.live(id)? else {
                return Ok(None);
            };
            let mut patch = patch;
            let now = Utc::now();

            let structural = match current.entity_type() {
                EntityType::Collection => {
                    let edits = CollectionEdits::take(id, &mut patch)?;
                    self.check_collection_edits(&current, &edits)?;
                    Structural::Collection(edits)
                }
                EntityType::Card => {
                    patch.remove("isLocalOnly");
                    match patch.remove("isPrivate") {
                        Some(private) => {
                            let private = private.as_bool().ok_or_else(|| {
                                Error::invariant("isPrivate must be a boolean")
                            })?;
                            Structural::Private(private)
                        }
                        None => Structural::Plain,
                    }
                }
                EntityType::Event | EntityType::Reference => Structural::Plain,
            };
            if !patch.is_empty() {
                let mut trial = current.clone();
                trial.apply_patch(&patch).map_err(|err| {
                    Error::invariant(format!("Invalid patch for {}: {}", id, err))
                })?;
            }

            match structural {
                Structural::Collection(edits) => self.apply_collection_edits(id, edits, now)?,
                Structural::Private(private) => {
                    self.cascade.set_card_private(id, private, now)?;
                }
                Structural::Plain => {}
            }

            let Some(before) = self.store().get(id)? else {
                return Ok(None);
            };
            if patch.is_empty() {
                return Ok(Some(before));
            }
            let mut after = before.clone();
            after
                .apply_patch(&patch)
                .map_err(|err| Error::invariant(format!("Invalid patch for {}: {}", id, err)))?;
            if after.entity_type() == EntityType::Card {
                let tree = self.cascade.tree(&after.workspace_id)?;
                self.cascade.normalize_card(&tree, &mut after);
            }
            if after == before {
                return Ok(Some(before));
            }
            after.touch(now);
            self.journal.record_update(&before, after).map(Some)
        })
    }

    /// Rejects structural edits that the cascade would refuse part way through.
    fn check_collection_edits(&self, current: &Entity, edits: &CollectionEdits) -> Result<()> {
        let Some(fields) = current.as_collection() else {
            return Ok(());
        };
        let tree = self.cascade.tree(&current.workspace_id)?;

        if let Some(slug) = edits.slug.as_deref().filter(|slug| *slug != fields.slug) {
            validate_slug(slug)?;
            if fields.is_system || fields.is_default {
                return Err(Error::invariant(format!(
                    "Collection '{}' cannot be renamed",
                    fields.slug
                )));
            }
            if tree.by_slug(slug).is_some_and(|node| node.id != current.id) {
                return Err(Error::invariant(format!(
                    "Slug '{}' is already used in this workspace",
                    slug
                )));
            }
        }

        if let Some(Some(parent_id)) = edits.parent.as_ref() {
            if tree.get(parent_id).is_none() {
                return Err(Error::invariant(format!(
                    "Parent collection {} does not exist",
                    parent_id
                )));
            }
            if tree.would_create_cycle(&current.id, Some(parent_id)) {
                return Err(Error::invariant(format!(
                    "Moving collection {} under {} would create a cycle",
                    current.id, parent_id
                )));
            }
        }

        if edits.local_only == Some(true) && (fields.is_system || fields.is_default) {
            return Err(Error::invariant(format!(
                "Collection '{}' cannot be made local-only",
                fields.slug
            )));
        }
        let local_only_after = edits.local_only.unwrap_or(fields.is_local_only);
        if edits.make_default && !fields.is_default && local_only_after {
            return Err(Error::invariant(format!(
                "Local-only collection '{}' cannot be the default",
                fields.slug
            )));
        }
        Ok(())
    }

    fn apply_collection_edits(
        &self,
        id: &str,
        edits: CollectionEdits,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(slug) = edits.slug.as_deref() {
            self.cascade.rename_collection(id, slug, now)?;
        }
        if let Some(parent) = edits.parent.as_ref() {
            self.cascade.reparent_collection(id, parent.as_deref(), now)?;
        }
        if let Some(local_only) = edits.local_only {
            self.cascade.set_collection_local_only(id, local_only, now)?;
        }
        if edits.make_default {
            self.make_default(id, now)?;
        }
        Ok(())
    }

    pub fn add_card_to_collection(&self, card_id: &str, slug: &str) -> Result<Option<Entity>> {
        self.commit(|| self.cascade.add_card_to_collection(card_id, slug, Utc::now()))
    }

    pub fn remove_card_from_collection(
        &self,
        card_id: &str,
        slug: &str,
    ) -> Result<Option<Entity>> {
        self.commit(|| {
            self.cascade
                .remove_card_from_collection(card_id, slug, Utc::now())
        })
    }

    pub fn set_card_private(&self, card_id: &str, private: bool) -> Result<Option<Entity>> {
        self.commit(|| self.cascade.set_card_private(card_id, private, Utc::now()))
    }

    pub fn rename_collection(&self, collection_id: &str, slug: &str) -> Result<Option<Entity>> {
        self.commit(|| self.cascade.rename_collection(collection_id, slug, Utc::now()))
    }

    pub fn move_collection(
        &self,
        collection_id: &str,
        new_parent_id: Option<&str>,
    ) -> Result<Option<Entity>> {
        self.commit(|| {
            self.cascade
                .reparent_collection(collection_id, new_parent_id, Utc::now())
        })
    }

    pub fn set_collection_local_only(
        &self,
        collection_id: &str,
        local_only: bool,
    ) -> Result<Option<Entity>> {
        self.commit(|| {
            self.cascade
                .set_collection_local_only(collection_id, local_only, Utc::now())
        })
    }

    pub fn set_default_collection(&self, collection_id: &str) -> Result<Option<Entity>> {
        self.commit(|| self.make_default(collection_id, Utc::now()))
    }

    fn make_default(&self, collection_id: &str, now: DateTime<Utc>) -> Result<Option<Entity>> {
        let Some(collection) = self.live(collection_id)? else {
            return Ok(None);
        };
        let Some(fields) = collection.as_collection() else {
            return Ok(None);
        };
        if fields.is_default {
            return Ok(Some(collection));
        }
        if fields.is_local_only {
            return Err(Error::invariant(format!(
                "Local-only collection '{}' cannot be the default",
                fields.slug
            )));
        }
        self.clear_default(&collection.workspace_id)?;
        let mut after = collection.clone();
        if let Some(fields) = after.as_collection_mut() {
            fields.is_default = true;
        }
        after.touch(now);
        info!("[Library] Collection {} is now the default", collection_id);
        self.journal.record_update(&collection, after).map(Some)
    }

    fn clear_default(&self, workspace_id: &str) -> Result<()> {
        let defaults = self.store().query(workspace_id, &|entity: &Entity| {
            !entity.deleted && entity.as_collection().is_some_and(|fields| fields.is_default)
        })?;
        let now = Utc::now();
        for before in defaults {
            let mut after = before.clone();
            if let Some(fields) = after.as_collection_mut() {
                fields.is_default = false;
            }
            after.touch(now);
            self.journal.record_update(&before, after)?;
        }
        Ok(())
    }

    /// Moves an entity to the trash and unlinks any conflict sibling.
    pub fn delete_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.commit(|| {
            let Some(entity) = self.live(id)? else {
                return Ok(None);
            };
            if let Some(fields) = entity.as_collection() {
                if fields.is_system || fields.is_default {
                    return Err(Error::invariant(format!(
                        "Collection '{}' cannot be deleted",
                        fields.slug
                    )));
                }
            }
            let now = Utc::now();
            let mut deleted = entity;
            deleted.mark_deleted(now);
            let deleted = self.journal.record_delete(deleted)?;
            if deleted.entity_type() == EntityType::Collection {
                self.cascade.on_collection_deleted(&deleted, now)?;
            }
            self.resolver.resolve_conflict_on_delete(&deleted, now)?;
            Ok(Some(deleted))
        })
    }

    pub fn restore_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.commit(|| {
            let Some(before) = self.store().get(id)?.filter(|entity| entity.deleted) else {
                warn!("[Library] {} is not in the trash", id);
                return Ok(None);
            };
            let now = Utc::now();
            let mut after = before.clone();
            after.restore(now);
            if let Some(fields) = after.as_collection() {
                let tree = self.cascade.tree(&after.workspace_id)?;
                if tree.by_slug(&fields.slug).is_some() {
                    return Err(Error::invariant(format!(
                        "Slug '{}' was reused while the collection was in the trash",
                        fields.slug
                    )));
                }
            }
            if after.entity_type() == EntityType::Card {
                let tree = self.cascade.tree(&after.workspace_id)?;
                self.cascade.normalize_card(&tree, &mut after);
            }
            self.journal.record_update(&before, after).map(Some)
        })
    }

    /// Removes a trashed entity for good and queues a `permanent-delete`.
    pub fn purge_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.commit(|| {
            let Some(entity) = self.store().get(id)? else {
                warn!("[Library] {} not found", id);
                return Ok(None);
            };
            if !entity.deleted {
                return Err(Error::invariant(format!(
                    "{} {} must be in the trash before it is purged",
                    entity.entity_type(),
                    id
                )));
            }
            self.journal.record_purge(&entity)?;
            Ok(Some(entity))
        })
    }

    /// Purges trashed entities older than the retention window.
    pub fn purge_expired_trash(&self, workspace_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.trash_retention_days);
        let purged = self.commit(|| {
            let expired = self.store().query(workspace_id, &|entity: &Entity| {
                entity.deleted && entity.deleted_at.is_some_and(|at| at < cutoff)
            })?;
            for entity in &expired {
                self.journal.record_purge(entity)?;
            }
            Ok((!expired.is_empty()).then_some(expired.len()))
        })?;
        let purged = purged.unwrap_or(0);
        if purged > 0 {
            info!(
                "[Library] Purged {} trashed entities older than {} days",
                purged, self.trash_retention_days
            );
        }
        Ok(purged)
    }

    pub fn get(&self, id: &str) -> Result<Option<Entity>> {
        self.store().get(id)
    }

    pub fn list(&self, workspace_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.store().list_live(workspace_id, entity_type)
    }

    pub fn list_trash(&self, workspace_id: &str) -> Result<Vec<Entity>> {
        self.store()
            .query(workspace_id, &|entity: &Entity| entity.deleted)
    }

    /// Live entities that carry a conflict link.
    pub fn list_conflicted(&self, workspace_id: &str) -> Result<Vec<Entity>> {
        self.store().query(workspace_id, &|entity: &Entity| {
            !entity.deleted && entity.is_conflicted()
        })
    }

    pub fn cards_in_collection(&self, workspace_id: &str, slug: &str) -> Result<Vec<Entity>> {
        self.store().query(workspace_id, &|entity: &Entity| {
            !entity.deleted
                && entity
                    .as_card()
                    .is_some_and(|fields| fields.tags.contains(slug))
        })
    }

    /// Slugs of every collection a card belongs to, ancestors included.
    pub fn card_collections(&self, card_id: &str) -> Result<BTreeSet<String>> {
        let Some(card) = self.store().get(card_id)? else {
            return Ok(BTreeSet::new());
        };
        let tree = self.cascade.tree(&card.workspace_id)?;
        Ok(card
            .as_card()
            .map(|fields| {
                fields
                    .tags
                    .iter()
                    .filter(|tag| tree.is_collection_slug(tag))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Read-model change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store().subscribe()
    }
}
