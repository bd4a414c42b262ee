//! Conflict Resolver: keeps both sides of a version mismatch.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::journal::Journal;
use super::sync_model::QueueEntry;
use crate::entities::Entity;
use crate::errors::{Error, Result};

/// Fields that legitimately differ between two copies of the same record.
const IDENTITY_FIELDS: [&str; 2] = ["createdAt", "_deletedAt"];

/// What the resolver did with one conflicting pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    /// Server copy, now stored locally as the canonical record.
    pub canonical: Entity,
    /// New local entity carrying the diverged local state, if any.
    pub fork: Option<Entity>,
    /// Pending queue entries for the canonical id that were superseded.
    pub discarded: usize,
}

pub struct ConflictResolver {
    journal: Journal,
}

impl ConflictResolver {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    /// Resolves a push that the remote answered with `conflict(server)`.
    ///
    /// The server copy becomes canonical. Diverged content is preserved as a
    /// fork linked through `conflictWithId`; diverged local-only fields are
    /// re-applied on top of the canonical copy without a version check.
    /// The caller holds the `WriteGate` and drops `entry` afterwards.
    pub fn resolve(
        &self,
        entry: &QueueEntry,
        server: Entity,
        now: DateTime<Utc>,
    ) -> Result<ConflictResolution> {
        if entry.skip_conflict_check {
            return Err(Error::invariant(format!(
                "Local-only update for {} {} reached conflict resolution",
                entry.entity_type, entry.entity_id
            )));
        }
        if server.id != entry.entity_id {
            return Err(Error::Unexpected(format!(
                "Remote answered a conflict on {} with entity {}",
                entry.entity_id, server.id
            )));
        }

        let store = self.journal.store();
        let local = store.get(&entry.entity_id)?;

        let mut canonical = server.clone();
        canonical.synced = true;
        canonical.last_modified = now;
        if let Some(local) = &local {
            canonical.version = canonical.version.max(local.version);
        }

        // Everything still pending for this id describes the local side,
        // which now lives on in the fork (or is re-applied below).
        let discarded = self
            .journal
            .queue()
            .discard(entry.entity_type, &entry.entity_id)?;

        let Some(local) = local else {
            store.put(canonical.clone())?;
            info!(
                "[Conflict] {} {} no longer exists locally, adopted server v{}",
                entry.entity_type, entry.entity_id, canonical.version
            );
            return Ok(ConflictResolution {
                canonical,
                fork: None,
                discarded,
            });
        };

        if local.deleted {
            // The local delete outlives the server edit: keep the tombstone
            // and journal the delete again behind the discarded entries.
            let mut tombstone = canonical;
            tombstone.mark_deleted(local.deleted_at.unwrap_or(now));
            let tombstone = self.journal.record_delete(tombstone)?;
            info!(
                "[Conflict] {} {} was deleted locally, delete re-queued over server v{}",
                entry.entity_type, entry.entity_id, tombstone.version
            );
            return Ok(ConflictResolution {
                canonical: tombstone,
                fork: None,
                discarded,
            });
        }

        store.put(canonical.clone())?;
        let (content, local_only) = self.split_divergence(&server, &local)?;

        let fork = if content.is_empty() {
            None
        } else {
            let fork = self.fork(&local, &canonical, now)?;
            info!(
                "[Conflict] {} {} forked into {} (server v{}, diverged fields: {:?})",
                entry.entity_type,
                entry.entity_id,
                fork.id,
                canonical.version,
                content.keys().collect::<Vec<_>>()
            );
            Some(fork)
        };

        if !local_only.is_empty() {
            let mut merged = canonical.clone();
            merged.apply_patch(&local_only)?;
            merged.touch(now);
            let merged = self.journal.record_update(&canonical, merged)?;
            info!(
                "[Conflict] {} {} adopted server v{} and kept local-only fields",
                entry.entity_type, entry.entity_id, merged.version
            );
            return Ok(ConflictResolution {
                canonical: merged,
                fork,
                discarded,
            });
        }

        if fork.is_none() {
            info!(
                "[Conflict] {} {} matches server v{}, nothing to fork",
                entry.entity_type, entry.entity_id, canonical.version
            );
        }
        Ok(ConflictResolution {
            canonical,
            fork,
            discarded,
        })
    }

    /// Splits local-vs-server differences into content and local-only fields.
    fn split_divergence(
        &self,
        server: &Entity,
        local: &Entity,
    ) -> Result<(Map<String, Value>, Map<String, Value>)> {
        let local_only_fields = self.journal.local_only_fields();
        let mut content = Map::new();
        let mut local_only = Map::new();
        for (key, value) in Entity::diff(server, local)? {
            if IDENTITY_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if local_only_fields.contains(&key) {
                local_only.insert(key, value);
            } else {
                content.insert(key, value);
            }
        }
        Ok((content, local_only))
    }

    fn fork(&self, local: &Entity, canonical: &Entity, now: DateTime<Utc>) -> Result<Entity> {
        let mut fork = local.clone();
        fork.id = Uuid::now_v7().to_string();
        fork.version = 1;
        fork.created_at = now;
        fork.conflict_with_id = Some(canonical.id.clone());
        fork.touch(now);
        let fork_id = fork.id.clone();
        if let Some(fields) = fork.as_collection_mut() {
            let suffix: String = fork_id
                .chars()
                .rev()
                .take(6)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            fields.slug = format!("{}-conflict-{}", fields.slug, suffix);
            fields.is_default = false;
            fields.is_system = false;
        }
        self.journal.record_create(fork)
    }

    /// Clears `conflictWithId` links pointing at (or from) a deleted entity.
    ///
    /// Returns the number of entities unlinked. The caller holds the `WriteGate`.
    pub fn resolve_conflict_on_delete(&self, deleted: &Entity, now: DateTime<Utc>) -> Result<usize> {
        let linked = self
            .journal
            .store()
            .query(&deleted.workspace_id, &|entity: &Entity| {
                entity.id != deleted.id
                    && !entity.deleted
                    && (entity.conflict_with_id.as_deref() == Some(deleted.id.as_str())
                        || (deleted.conflict_with_id.as_deref() == Some(entity.id.as_str())
                            && entity.conflict_with_id.is_some()))
            })?;

        let mut unlinked = 0;
        for entity in linked {
            let mut after = entity.clone();
            after.conflict_with_id = None;
            after.touch(now);
            match self.journal.record_update(&entity, after) {
                Ok(_) => unlinked += 1,
                Err(err) => {
                    warn!("[Conflict] Failed to unlink {}: {}", entity.id, err);
                    return Err(err);
                }
            }
        }
        if unlinked > 0 {
            info!(
                "[Conflict] Cleared {} conflict link(s) after deleting {}",
                unlinked, deleted.id
            );
        }
        Ok(unlinked)
    }
}
