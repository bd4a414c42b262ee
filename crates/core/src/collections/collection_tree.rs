//! Parent-indexed view of a workspace's live collections.
//!
//! Traversals are iterative with visited sets, so a corrupt parent chain
//! terminates instead of looping.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::entities::Entity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNode {
    pub id: String,
    pub slug: String,
    pub parent_id: Option<String>,
    pub is_local_only: bool,
    pub is_system: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionTree {
    nodes: HashMap<String, CollectionNode>,
    slug_index: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

impl CollectionTree {
    /// Builds the tree from store rows; non-collections and soft-deleted rows are ignored.
    pub fn from_entities<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Self {
        let mut tree = Self::default();
        for entity in entities {
            if entity.deleted {
                continue;
            }
            let Some(collection) = entity.as_collection() else {
                continue;
            };
            tree.insert(CollectionNode {
                id: entity.id.clone(),
                slug: collection.slug.clone(),
                parent_id: collection.parent_id.clone(),
                is_local_only: collection.is_local_only,
                is_system: collection.is_system,
                is_default: collection.is_default,
            });
        }
        tree
    }

    fn insert(&mut self, node: CollectionNode) {
        if let Some(parent_id) = &node.parent_id {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .push(node.id.clone());
        }
        self.slug_index.insert(node.slug.clone(), node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CollectionNode> {
        self.nodes.get(id)
    }

    pub fn by_slug(&self, slug: &str) -> Option<&CollectionNode> {
        self.slug_index.get(slug).and_then(|id| self.nodes.get(id))
    }

    pub fn is_collection_slug(&self, slug: &str) -> bool {
        self.slug_index.contains_key(slug)
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors(&self, id: &str) -> Vec<&CollectionNode> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([id.to_string()]);
        let mut cursor = self.nodes.get(id).and_then(|node| node.parent_id.as_deref());
        while let Some(parent_id) = cursor {
            if !visited.insert(parent_id.to_string()) {
                log::warn!("[Cascade] Parent cycle detected at collection {}", parent_id);
                break;
            }
            let Some(parent) = self.nodes.get(parent_id) else {
                break;
            };
            chain.push(parent);
            cursor = parent.parent_id.as_deref();
        }
        chain
    }

    /// Every collection below `id`, breadth first, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> Vec<&CollectionNode> {
        let mut found = Vec::new();
        let mut visited = HashSet::from([id.to_string()]);
        let mut frontier = VecDeque::from([id.to_string()]);
        while let Some(current) = frontier.pop_front() {
            for child_id in self.children.get(&current).into_iter().flatten() {
                if !visited.insert(child_id.clone()) {
                    continue;
                }
                if let Some(child) = self.nodes.get(child_id) {
                    found.push(child);
                    frontier.push_back(child_id.clone());
                }
            }
        }
        found
    }

    /// True when re-parenting `id` under `new_parent_id` would close a loop.
    pub fn would_create_cycle(&self, id: &str, new_parent_id: Option<&str>) -> bool {
        let Some(new_parent_id) = new_parent_id else {
            return false;
        };
        new_parent_id == id
            || self
                .descendants(id)
                .iter()
                .any(|node| node.id == new_parent_id)
    }

    /// Slugs of the collection named by `slug` and all of its ancestors.
    pub fn path_slugs(&self, slug: &str) -> Vec<String> {
        let Some(node) = self.by_slug(slug) else {
            return Vec::new();
        };
        std::iter::once(node)
            .chain(self.ancestors(&node.id))
            .map(|node| node.slug.clone())
            .collect()
    }

    /// Adds every ancestor slug implied by the collection tags in `tags`.
    pub fn close_over_ancestors(&self, tags: &BTreeSet<String>) -> BTreeSet<String> {
        let mut closed = tags.clone();
        for tag in tags {
            closed.extend(self.path_slugs(tag));
        }
        closed
    }

    /// True when any tag names a local-only collection.
    pub fn touches_local_only(&self, tags: &BTreeSet<String>) -> bool {
        tags.iter()
            .filter_map(|tag| self.by_slug(tag))
            .any(|node| node.is_local_only)
    }

    pub fn default_collection(&self) -> Option<&CollectionNode> {
        self.nodes.values().find(|node| node.is_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CollectionFields, EntityBody};
    use chrono::Utc;

    pub(crate) fn collection(id: &str, slug: &str, parent: Option<&str>) -> Entity {
        let mut fields = CollectionFields::new(slug, slug);
        fields.parent_id = parent.map(str::to_string);
        let mut entity = Entity::new("ws-1", EntityBody::Collection(fields), Utc::now());
        entity.id = id.to_string();
        entity
    }

    fn sample() -> CollectionTree {
        let rows = vec![
            collection("root", "root", None),
            collection("p2", "p2", Some("root")),
            collection("p1", "p1", Some("p2")),
            collection("c", "c", Some("p1")),
            collection("sibling", "sibling", Some("p2")),
        ];
        CollectionTree::from_entities(&rows)
    }

    #[test]
    fn ancestors_walk_to_the_root() {
        let tree = sample();
        let slugs: Vec<_> = tree.ancestors("c").iter().map(|n| n.slug.as_str()).collect();
        assert_eq!(slugs, vec!["p1", "p2", "root"]);
    }

    #[test]
    fn descendants_are_breadth_first() {
        let tree = sample();
        let ids: BTreeSet<_> = tree.descendants("p2").iter().map(|n| n.id.clone()).collect();
        assert_eq!(
            ids,
            BTreeSet::from(["p1".to_string(), "c".to_string(), "sibling".to_string()])
        );
        assert!(tree.descendants("c").is_empty());
    }

    #[test]
    fn reparent_under_descendant_is_a_cycle() {
        let tree = sample();
        assert!(tree.would_create_cycle("p2", Some("c")));
        assert!(tree.would_create_cycle("p2", Some("p2")));
        assert!(!tree.would_create_cycle("c", Some("sibling")));
        assert!(!tree.would_create_cycle("c", None));
    }

    #[test]
    fn corrupt_parent_chain_terminates() {
        let rows = vec![collection("a", "a", Some("b")), collection("b", "b", Some("a"))];
        let tree = CollectionTree::from_entities(&rows);
        assert_eq!(tree.ancestors("a").len(), 1);
        assert_eq!(tree.descendants("a").len(), 1);
    }

    #[test]
    fn closure_adds_ancestor_slugs_only_for_collection_tags() {
        let tree = sample();
        let tags = BTreeSet::from(["c".to_string(), "reading".to_string()]);
        let closed = tree.close_over_ancestors(&tags);
        for slug in ["c", "p1", "p2", "root", "reading"] {
            assert!(closed.contains(slug), "missing {}", slug);
        }
        assert!(!closed.contains("sibling"));
    }

    #[test]
    fn deleted_collections_are_not_part_of_the_tree() {
        let mut gone = collection("gone", "gone", None);
        gone.mark_deleted(Utc::now());
        let tree = CollectionTree::from_entities(&[gone]);
        assert!(tree.is_empty());
    }
}
