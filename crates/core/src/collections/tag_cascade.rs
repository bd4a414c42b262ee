//! Tag Cascade Manager: keeps card tags consistent with collection membership.
//!
//! Invariant: a card tagged with a collection slug also carries the slugs of
//! every ancestor of that collection. A card is local-only when the user made it
//! private or when any of its collection tags names a local-only collection.
//! All methods expect the caller to hold the `WriteGate`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::collection_tree::CollectionTree;
use crate::entities::{Entity, EntityType};
use crate::errors::{Error, Result};
use crate::sync::Journal;

/// Slugs are lowercase URL-safe segments: `[a-z0-9-]`, no leading/trailing `-`.
pub fn validate_slug(slug: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::invariant(format!("'{}' is not a valid slug", slug)))
    }
}

/// Drops `candidates` from `tags` unless another collection tag still implies them.
fn drop_unjustified(
    tags: &BTreeSet<String>,
    candidates: &BTreeSet<String>,
    tree: &CollectionTree,
) -> BTreeSet<String> {
    let justified: BTreeSet<String> = tags
        .iter()
        .filter(|tag| tree.is_collection_slug(tag) && !candidates.contains(*tag))
        .flat_map(|tag| tree.path_slugs(tag))
        .collect();
    tags.iter()
        .filter(|tag| !candidates.contains(*tag) || justified.contains(*tag))
        .cloned()
        .collect()
}

pub struct TagCascadeManager {
    journal: Journal,
}

impl TagCascadeManager {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    pub fn tree(&self, workspace_id: &str) -> Result<CollectionTree> {
        let rows = self
            .journal
            .store()
            .list_live(workspace_id, EntityType::Collection)?;
        Ok(CollectionTree::from_entities(&rows))
    }

    /// All cards of a workspace, trashed ones included so a restore finds
    /// consistent tags.
    fn cards(&self, workspace_id: &str) -> Result<Vec<Entity>> {
        self.journal
            .store()
            .query(workspace_id, &|entity| entity.entity_type() == EntityType::Card)
    }

    fn live_card(&self, card_id: &str) -> Result<Option<Entity>> {
        let card = self
            .journal
            .store()
            .get(card_id)?
            .filter(|entity| !entity.deleted && entity.entity_type() == EntityType::Card);
        if card.is_none() {
            warn!("[Cascade] Card {} not found", card_id);
        }
        Ok(card)
    }

    fn live_collection(&self, collection_id: &str) -> Result<Option<Entity>> {
        let collection = self.journal.store().get(collection_id)?.filter(|entity| {
            !entity.deleted && entity.entity_type() == EntityType::Collection
        });
        if collection.is_none() {
            warn!("[Cascade] Collection {} not found", collection_id);
        }
        Ok(collection)
    }

    /// Closes a card's tags over ancestors and recomputes its local-only state.
    pub fn normalize_card(&self, tree: &CollectionTree, card: &mut Entity) {
        if let Some(fields) = card.as_card_mut() {
            fields.tags = tree.close_over_ancestors(&fields.tags);
            fields.is_local_only = fields.is_private || tree.touches_local_only(&fields.tags);
        }
    }

    /// Journals `after` when normalization or the edit changed anything.
    fn commit_card(
        &self,
        tree: &CollectionTree,
        before: &Entity,
        mut after: Entity,
        now: DateTime<Utc>,
    ) -> Result<Entity> {
        self.normalize_card(tree, &mut after);
        if &after == before {
            return Ok(after);
        }
        after.touch(now);
        self.journal.record_update(before, after)
    }

    pub fn add_card_to_collection(
        &self,
        card_id: &str,
        collection_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        let Some(card) = self.live_card(card_id)? else {
            return Ok(None);
        };
        let tree = self.tree(&card.workspace_id)?;
        if tree.by_slug(collection_slug).is_none() {
            warn!("[Cascade] Collection '{}' not found", collection_slug);
            return Ok(None);
        }

        let mut after = card.clone();
        if let Some(fields) = after.as_card_mut() {
            fields.tags.extend(tree.path_slugs(collection_slug));
        }
        debug!("[Cascade] Adding card {} to '{}'", card_id, collection_slug);
        self.commit_card(&tree, &card, after, now).map(Some)
    }

    /// Removes membership and re-derives ancestor tags from what remains.
    ///
    /// Descendant memberships go with it; an ancestor slug survives only when
    /// another branch still implies it.
    pub fn remove_card_from_collection(
        &self,
        card_id: &str,
        collection_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        let Some(card) = self.live_card(card_id)? else {
            return Ok(None);
        };
        let tree = self.tree(&card.workspace_id)?;

        let mut after = card.clone();
        if let Some(fields) = after.as_card_mut() {
            let mut tags = fields.tags.clone();
            tags.remove(collection_slug);
            if let Some(node) = tree.by_slug(collection_slug) {
                for descendant in tree.descendants(&node.id) {
                    tags.remove(&descendant.slug);
                }
                let ancestors: BTreeSet<String> = tree
                    .ancestors(&node.id)
                    .into_iter()
                    .map(|ancestor| ancestor.slug.clone())
                    .collect();
                tags = drop_unjustified(&tags, &ancestors, &tree);
            }
            fields.tags = tags;
        }
        debug!("[Cascade] Removing card {} from '{}'", card_id, collection_slug);
        self.commit_card(&tree, &card, after, now).map(Some)
    }

    /// Changes a collection's slug and retags every card carrying the old one.
    pub fn rename_collection(
        &self,
        collection_id: &str,
        new_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        validate_slug(new_slug)?;
        let Some(collection) = self.live_collection(collection_id)? else {
            return Ok(None);
        };
        let old_slug = match collection.as_collection() {
            Some(fields) if fields.is_system || fields.is_default => {
                return Err(Error::invariant(format!(
                    "Collection '{}' cannot be renamed",
                    fields.slug
                )));
            }
            Some(fields) => fields.slug.clone(),
            None => return Ok(None),
        };
        if old_slug == new_slug {
            return Ok(Some(collection));
        }
        let tree = self.tree(&collection.workspace_id)?;
        if tree.by_slug(new_slug).is_some() {
            return Err(Error::invariant(format!(
                "Slug '{}' is already used in this workspace",
                new_slug
            )));
        }

        let mut renamed = collection.clone();
        if let Some(fields) = renamed.as_collection_mut() {
            fields.slug = new_slug.to_string();
        }
        renamed.touch(now);
        let renamed = self.journal.record_update(&collection, renamed)?;

        let mut retagged = 0usize;
        for card in self.cards(&collection.workspace_id)? {
            let carries_old = card
                .as_card()
                .is_some_and(|fields| fields.tags.contains(&old_slug));
            if !carries_old {
                continue;
            }
            let mut after = card.clone();
            if let Some(fields) = after.as_card_mut() {
                fields.tags.remove(&old_slug);
                fields.tags.insert(new_slug.to_string());
            }
            after.touch(now);
            self.journal.record_update(&card, after)?;
            retagged += 1;
        }
        info!(
            "[Cascade] Renamed collection '{}' -> '{}', retagged {} cards",
            old_slug, new_slug, retagged
        );
        Ok(Some(renamed))
    }

    /// Moves a collection under `new_parent_id` after checking for cycles.
    pub fn reparent_collection(
        &self,
        collection_id: &str,
        new_parent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        let Some(collection) = self.live_collection(collection_id)? else {
            return Ok(None);
        };
        let tree = self.tree(&collection.workspace_id)?;
        if let Some(parent_id) = new_parent_id {
            if tree.get(parent_id).is_none() {
                return Err(Error::invariant(format!(
                    "Parent collection {} does not exist",
                    parent_id
                )));
            }
        }
        if tree.would_create_cycle(collection_id, new_parent_id) {
            return Err(Error::invariant(format!(
                "Moving collection {} under {:?} would create a cycle",
                collection_id, new_parent_id
            )));
        }
        let current_parent = collection
            .as_collection()
            .and_then(|fields| fields.parent_id.clone());
        if current_parent.as_deref() == new_parent_id {
            return Ok(Some(collection));
        }

        let old_ancestors: BTreeSet<String> = tree
            .ancestors(collection_id)
            .into_iter()
            .map(|node| node.slug.clone())
            .collect();

        let mut moved = collection.clone();
        if let Some(fields) = moved.as_collection_mut() {
            fields.parent_id = new_parent_id.map(str::to_string);
        }
        moved.touch(now);
        let moved = self.journal.record_update(&collection, moved)?;

        let tree = self.tree(&collection.workspace_id)?;
        let subtree: BTreeSet<String> = std::iter::once(collection_id)
            .chain(
                tree.descendants(collection_id)
                    .into_iter()
                    .map(|node| node.id.as_str()),
            )
            .filter_map(|id| tree.get(id).map(|node| node.slug.clone()))
            .collect();

        for card in self.cards(&collection.workspace_id)? {
            let in_subtree = card
                .as_card()
                .is_some_and(|fields| !fields.tags.is_disjoint(&subtree));
            if !in_subtree {
                continue;
            }
            let mut after = card.clone();
            if let Some(fields) = after.as_card_mut() {
                fields.tags = drop_unjustified(&fields.tags, &old_ancestors, &tree);
            }
            self.commit_card(&tree, &card, after, now)?;
        }
        Ok(Some(moved))
    }

    /// Flips local-only on a collection, its descendants and every member card.
    ///
    /// Each crossing of the boundary is journaled as a `delete` + `create` pair.
    pub fn set_collection_local_only(
        &self,
        collection_id: &str,
        local_only: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        let Some(collection) = self.live_collection(collection_id)? else {
            return Ok(None);
        };
        if local_only {
            if let Some(fields) = collection.as_collection() {
                if fields.is_system || fields.is_default {
                    return Err(Error::invariant(format!(
                        "Collection '{}' cannot be made local-only",
                        fields.slug
                    )));
                }
            }
        }

        let tree = self.tree(&collection.workspace_id)?;
        let affected_ids: Vec<String> = std::iter::once(collection_id.to_string())
            .chain(
                tree.descendants(collection_id)
                    .into_iter()
                    .map(|node| node.id.clone()),
            )
            .collect();

        let mut affected_slugs = BTreeSet::new();
        let mut updated_root = None;
        for id in &affected_ids {
            let Some(before) = self.journal.store().get(id)? else {
                continue;
            };
            let mut after = before.clone();
            if let Some(fields) = after.as_collection_mut() {
                affected_slugs.insert(fields.slug.clone());
                fields.is_local_only = local_only;
            }
            let stored = if after == before {
                after
            } else {
                after.touch(now);
                self.journal.record_update(&before, after)?
            };
            if id == collection_id {
                updated_root = Some(stored);
            }
        }

        let tree = self.tree(&collection.workspace_id)?;
        let mut flipped_cards = 0usize;
        for card in self.cards(&collection.workspace_id)? {
            let is_member = card
                .as_card()
                .is_some_and(|fields| !fields.tags.is_disjoint(&affected_slugs));
            if !is_member {
                continue;
            }
            let after = self.commit_card(&tree, &card, card.clone(), now)?;
            if after.is_local_only() != card.is_local_only() {
                flipped_cards += 1;
            }
        }
        info!(
            "[Cascade] Collection {} local_only={} affected {} collections, {} cards",
            collection_id,
            local_only,
            affected_ids.len(),
            flipped_cards
        );
        Ok(updated_root)
    }

    /// Toggles the user's privacy flag on a single card.
    pub fn set_card_private(
        &self,
        card_id: &str,
        private: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Entity>> {
        let Some(card) = self.live_card(card_id)? else {
            return Ok(None);
        };
        let tree = self.tree(&card.workspace_id)?;
        let mut after = card.clone();
        if let Some(fields) = after.as_card_mut() {
            fields.is_private = private;
        }
        self.commit_card(&tree, &card, after, now).map(Some)
    }

    /// Re-homes children and strips the slug from member cards after a
    /// collection was soft-deleted.
    pub fn on_collection_deleted(&self, collection: &Entity, now: DateTime<Utc>) -> Result<()> {
        let Some(fields) = collection.as_collection() else {
            return Ok(());
        };
        let workspace_id = &collection.workspace_id;

        let children = self.journal.store().query(workspace_id, &|entity| {
            !entity.deleted
                && entity
                    .as_collection()
                    .is_some_and(|child| child.parent_id.as_deref() == Some(collection.id.as_str()))
        })?;
        for child in children {
            let mut after = child.clone();
            if let Some(child_fields) = after.as_collection_mut() {
                child_fields.parent_id = fields.parent_id.clone();
            }
            after.touch(now);
            self.journal.record_update(&child, after)?;
        }

        let tree = self.tree(workspace_id)?;
        for card in self.cards(workspace_id)? {
            let is_member = card
                .as_card()
                .is_some_and(|card_fields| card_fields.tags.contains(&fields.slug));
            if !is_member {
                continue;
            }
            let mut after = card.clone();
            if let Some(card_fields) = after.as_card_mut() {
                card_fields.tags.remove(&fields.slug);
            }
            self.commit_card(&tree, &card, after, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CardFields, CardType, CollectionFields, EntityBody};
    use crate::store::{LocalStore, MemoryStore};
    use crate::sync::{LocalOnlyFields, MemorySyncQueue, SyncOperation, SyncQueue};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemorySyncQueue>,
        cascade: TagCascadeManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemorySyncQueue::new());
        let journal = Journal::new(store.clone(), queue.clone(), LocalOnlyFields::default());
        Fixture {
            store,
            queue,
            cascade: TagCascadeManager::new(journal),
        }
    }

    impl Fixture {
        fn collection(&self, id: &str, slug: &str, parent: Option<&str>) {
            let mut fields = CollectionFields::new(slug, slug);
            fields.parent_id = parent.map(str::to_string);
            let mut entity = Entity::new("ws-1", EntityBody::Collection(fields), Utc::now());
            entity.id = id.to_string();
            entity.synced = true;
            self.store.put(entity).expect("put collection");
        }

        fn card(&self, id: &str, tags: &[&str]) {
            let mut fields = CardFields::new(CardType::Url, id);
            fields.tags = tags.iter().map(|t| t.to_string()).collect();
            let mut entity = Entity::new("ws-1", EntityBody::Card(fields), Utc::now());
            entity.id = id.to_string();
            entity.synced = true;
            self.store.put(entity).expect("put card");
        }

        fn tags(&self, id: &str) -> BTreeSet<String> {
            self.store
                .get(id)
                .expect("get")
                .expect("exists")
                .as_card()
                .expect("card")
                .tags
                .clone()
        }

        fn ops_for(&self, id: &str) -> Vec<SyncOperation> {
            self.queue
                .list()
                .expect("list")
                .into_iter()
                .filter(|entry| entry.entity_id == id)
                .map(|entry| entry.operation)
                .collect()
        }

        /// root <- p2 <- p1 <- c, plus p2 <- sibling
        fn hierarchy(&self) {
            self.collection("root", "root", None);
            self.collection("p2", "p2", Some("root"));
            self.collection("p1", "p1", Some("p2"));
            self.collection("c", "c", Some("p1"));
            self.collection("sibling", "sibling", Some("p2"));
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("work-2024").is_ok());
        assert!(validate_slug("Work").is_err());
        assert!(validate_slug("-work").is_err());
        assert!(validate_slug("a b").is_err());
        assert!(validate_slug("").is_err());
    }

    #[test]
    fn add_card_tags_every_ancestor() {
        let fx = fixture();
        fx.hierarchy();
        fx.card("card", &["reading"]);

        fx.cascade
            .add_card_to_collection("card", "c", Utc::now())
            .expect("add")
            .expect("card exists");

        let tags = fx.tags("card");
        assert!(tags.is_superset(&set(&["c", "p1", "p2", "root", "reading"])));
        assert!(!tags.contains("sibling"));

        let entries = fx.queue.list().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, SyncOperation::Update);
        assert!(entries[0].skip_conflict_check);
    }

    #[test]
    fn add_to_unknown_collection_is_a_no_op() {
        let fx = fixture();
        fx.card("card", &[]);
        let result = fx
            .cascade
            .add_card_to_collection("card", "missing", Utc::now())
            .expect("add");
        assert!(result.is_none());
        assert_eq!(fx.queue.pending_count().expect("count"), 0);
    }

    #[test]
    fn remove_keeps_ancestors_still_implied_by_another_branch() {
        let fx = fixture();
        fx.hierarchy();
        fx.card("card", &["c", "p1", "p2", "root", "sibling"]);

        fx.cascade
            .remove_card_from_collection("card", "c", Utc::now())
            .expect("remove");

        assert_eq!(fx.tags("card"), set(&["p2", "root", "sibling"]));
    }

    #[test]
    fn remove_drops_ancestors_implied_only_by_removed_collection() {
        let fx = fixture();
        fx.hierarchy();
        fx.card("card", &["c", "p1", "p2", "root", "reading"]);

        fx.cascade
            .remove_card_from_collection("card", "c", Utc::now())
            .expect("remove");

        assert_eq!(fx.tags("card"), set(&["reading"]));
    }

    #[test]
    fn remove_from_parent_drops_descendant_memberships() {
        let fx = fixture();
        fx.hierarchy();
        fx.card("card", &["c", "p1", "p2", "root"]);

        fx.cascade
            .remove_card_from_collection("card", "p1", Utc::now())
            .expect("remove");

        assert!(fx.tags("card").is_empty());
    }

    #[test]
    fn rename_retags_every_member_card() {
        let fx = fixture();
        fx.collection("work", "work", None);
        fx.card("a", &["work"]);
        fx.card("b", &["work", "misc"]);
        fx.card("c", &["misc"]);

        fx.cascade
            .rename_collection("work", "job", Utc::now())
            .expect("rename");

        assert_eq!(fx.tags("a"), set(&["job"]));
        assert_eq!(fx.tags("b"), set(&["job", "misc"]));
        assert_eq!(fx.tags("c"), set(&["misc"]));

        let rename = fx.queue.list().expect("list");
        let collection_entry = rename
            .iter()
            .find(|entry| entry.entity_id == "work")
            .expect("collection queued");
        assert_eq!(collection_entry.payload["slug"], serde_json::json!("job"));
        assert!(fx.ops_for("c").is_empty());
    }

    #[test]
    fn rename_rejects_duplicate_and_invalid_slugs() {
        let fx = fixture();
        fx.collection("work", "work", None);
        fx.collection("home", "home", None);

        assert!(matches!(
            fx.cascade.rename_collection("work", "home", Utc::now()),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            fx.cascade.rename_collection("work", "Not A Slug", Utc::now()),
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(fx.queue.pending_count().expect("count"), 0);
    }

    #[test]
    fn reparent_into_own_subtree_is_rejected_before_writing() {
        let fx = fixture();
        fx.hierarchy();

        let result = fx.cascade.reparent_collection("p2", Some("c"), Utc::now());
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert_eq!(fx.queue.pending_count().expect("count"), 0);
        let p2 = fx.store.get("p2").expect("get").expect("exists");
        assert_eq!(
            p2.as_collection().expect("collection").parent_id.as_deref(),
            Some("root")
        );
    }

    #[test]
    fn reparent_moves_ancestor_tags_of_member_cards() {
        let fx = fixture();
        fx.hierarchy();
        fx.collection("other", "other", None);
        fx.card("card", &["c", "p1", "p2", "root"]);

        fx.cascade
            .reparent_collection("p1", Some("other"), Utc::now())
            .expect("reparent");

        assert_eq!(fx.tags("card"), set(&["c", "p1", "other"]));
    }

    #[test]
    fn local_only_flip_queues_delete_create_pairs_for_members() {
        let fx = fixture();
        fx.collection("work", "work", None);
        fx.collection("clients", "clients", Some("work"));
        fx.card("a", &["work"]);
        fx.card("b", &["clients", "work"]);
        fx.card("c", &["misc"]);

        fx.cascade
            .set_collection_local_only("work", true, Utc::now())
            .expect("flip");

        for id in ["work", "clients", "a", "b"] {
            assert_eq!(
                fx.ops_for(id),
                vec![SyncOperation::Delete, SyncOperation::Create],
                "entity {}",
                id
            );
            assert!(fx.store.get(id).expect("get").expect("exists").is_local_only());
        }
        assert!(fx.ops_for("c").is_empty());
        assert!(fx
            .queue
            .list()
            .expect("list")
            .iter()
            .all(|entry| entry.operation != SyncOperation::Update));
    }

    #[test]
    fn unflipping_keeps_privately_marked_cards_local() {
        let fx = fixture();
        fx.collection("work", "work", None);
        fx.card("shared", &["work"]);
        fx.card("secret", &["work"]);
        fx.cascade
            .set_card_private("secret", true, Utc::now())
            .expect("private");
        fx.cascade
            .set_collection_local_only("work", true, Utc::now())
            .expect("flip on");
        fx.cascade
            .set_collection_local_only("work", false, Utc::now())
            .expect("flip off");

        assert!(!fx.store.get("shared").expect("get").expect("exists").is_local_only());
        assert!(fx.store.get("secret").expect("get").expect("exists").is_local_only());
    }

    #[test]
    fn default_collection_cannot_become_local_only() {
        let fx = fixture();
        fx.collection("inbox", "inbox", None);
        fx.store
            .update("inbox", &mut |entity| {
                if let Some(fields) = entity.as_collection_mut() {
                    fields.is_default = true;
                }
            })
            .expect("update");

        assert!(matches!(
            fx.cascade.set_collection_local_only("inbox", true, Utc::now()),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn deleting_a_collection_rehomes_children_and_strips_slug() {
        let fx = fixture();
        fx.hierarchy();
        fx.card("card", &["p1", "p2", "root"]);

        let mut p1 = fx.store.get("p1").expect("get").expect("exists");
        p1.mark_deleted(Utc::now());
        fx.store.put(p1.clone()).expect("put");
        fx.cascade
            .on_collection_deleted(&p1, Utc::now())
            .expect("cascade");

        let c = fx.store.get("c").expect("get").expect("exists");
        assert_eq!(
            c.as_collection().expect("collection").parent_id.as_deref(),
            Some("p2")
        );
        assert_eq!(fx.tags("card"), set(&["p2", "root"]));
    }
}
