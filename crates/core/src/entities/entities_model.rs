//! Entity envelope shared by cards, collections, events and references.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Fields a patch may never overwrite; they are owned by the envelope or the server.
const PROTECTED_FIELDS: [&str; 5] = ["id", "workspaceId", "entityType", "version", "createdAt"];

/// Bookkeeping fields that never take part in a payload diff.
const BOOKKEEPING_FIELDS: [&str; 4] = ["_synced", "_lastModified", "updatedAt", "version"];

/// Local-only metadata stripped before an entity is sent to the remote.
const LOCAL_METADATA_FIELDS: [&str; 2] = ["_synced", "_lastModified"];

/// Entity kinds handled by the sync engine. One local table and one remote
/// collection exist per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Card,
    Collection,
    Event,
    Reference,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Card,
        EntityType::Collection,
        EntityType::Event,
        EntityType::Reference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Card => "card",
            EntityType::Collection => "collection",
            EntityType::Event => "event",
            EntityType::Reference => "reference",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardType {
    Url,
    Note,
    QuickNote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardFields {
    #[serde(rename = "type")]
    pub card_type: CardType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: String,
    /// User tags plus collection-membership slugs (ancestor inclusive).
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub read_progress: Option<f64>,
    #[serde(default)]
    pub last_opened_at: Option<DateTime<Utc>>,
    /// The user's own privacy choice for this card.
    #[serde(default)]
    pub is_private: bool,
    /// Effective local-only state: private, or member of a local-only collection.
    #[serde(default)]
    pub is_local_only: bool,
}

impl CardFields {
    pub fn new(card_type: CardType, title: impl Into<String>) -> Self {
        Self {
            card_type,
            title: title.into(),
            url: None,
            content: String::new(),
            tags: BTreeSet::new(),
            pinned: false,
            read_progress: None,
            last_opened_at: None,
            is_private: false,
            is_local_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFields {
    #[serde(default)]
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_local_only: bool,
    #[serde(default)]
    pub is_system: bool,
    /// Workspace-level default container; at most one live collection per workspace.
    #[serde(default)]
    pub is_default: bool,
}

impl CollectionFields {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            parent_id: None,
            is_local_only: false,
            is_system: false,
            is_default: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    #[serde(default)]
    pub title: String,
    /// ISO-8601 calendar date.
    pub date: String,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFields {
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Type-specific part of an entity, tagged by `entityType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "snake_case")]
pub enum EntityBody {
    Card(CardFields),
    Collection(CollectionFields),
    Event(EventFields),
    Reference(ReferenceFields),
}

impl EntityBody {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityBody::Card(_) => EntityType::Card,
            EntityBody::Collection(_) => EntityType::Collection,
            EntityBody::Event(_) => EntityType::Event,
            EntityBody::Reference(_) => EntityType::Reference,
        }
    }
}

fn default_version() -> i64 {
    1
}

/// A synced record with its local bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub workspace_id: String,
    /// Last version acknowledged by the server. Never decreases.
    #[serde(default = "default_version")]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_synced", default)]
    pub synced: bool,
    #[serde(rename = "_lastModified", default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
    #[serde(rename = "_deletedAt", default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conflict_with_id: Option<String>,
    #[serde(flatten)]
    pub body: EntityBody,
}

impl Entity {
    /// Creates a fresh, unsynced entity at version 1 with a client-generated id.
    pub fn new(workspace_id: impl Into<String>, body: EntityBody, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workspace_id: workspace_id.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            synced: false,
            last_modified: now,
            deleted: false,
            deleted_at: None,
            conflict_with_id: None,
            body,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }

    pub fn as_card(&self) -> Option<&CardFields> {
        match &self.body {
            EntityBody::Card(card) => Some(card),
            _ => None,
        }
    }

    pub fn as_card_mut(&mut self) -> Option<&mut CardFields> {
        match &mut self.body {
            EntityBody::Card(card) => Some(card),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionFields> {
        match &self.body {
            EntityBody::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn as_collection_mut(&mut self) -> Option<&mut CollectionFields> {
        match &mut self.body {
            EntityBody::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// True when the entity must never be present on the remote.
    pub fn is_local_only(&self) -> bool {
        match &self.body {
            EntityBody::Card(card) => card.is_local_only,
            EntityBody::Collection(collection) => collection.is_local_only,
            EntityBody::Event(_) | EntityBody::Reference(_) => false,
        }
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflict_with_id.is_some()
    }

    /// Records a local mutation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.last_modified = now;
        self.synced = false;
    }

    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.deleted = true;
        self.deleted_at = Some(now);
        self.touch(now);
    }

    pub fn restore(&mut self, now: DateTime<Utc>) {
        self.deleted = false;
        self.deleted_at = None;
        self.touch(now);
    }

    pub fn to_json(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Unexpected(format!(
                "Entity {} serialized to non-object JSON: {}",
                self.id, other
            ))),
        }
    }

    pub fn from_json(map: Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// JSON body for the remote: entity minus local-only bookkeeping.
    pub fn to_remote_json(&self) -> Result<Map<String, Value>> {
        let mut map = self.to_json()?;
        for key in LOCAL_METADATA_FIELDS {
            map.remove(key);
        }
        Ok(map)
    }

    /// Shallow-merges `patch` into the entity (latest field wins).
    ///
    /// Envelope identity fields are ignored. The entity is left untouched when
    /// the patched document no longer deserializes.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let mut map = self.to_json()?;
        for (key, value) in patch {
            if PROTECTED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            map.insert(key.clone(), value.clone());
        }
        *self = Self::from_json(map)?;
        Ok(())
    }

    /// Fields whose value differs between `before` and `after`, taken from `after`.
    pub fn diff(before: &Entity, after: &Entity) -> Result<Map<String, Value>> {
        let before = before.to_json()?;
        let after = after.to_json()?;
        let mut changed = Map::new();
        for (key, value) in after {
            if BOOKKEEPING_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if before.get(&key) != Some(&value) {
                changed.insert(key, value);
            }
        }
        Ok(changed)
    }
}
