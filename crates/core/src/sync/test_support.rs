//! In-process remote used by engine and library tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::remote::{PullRequest, PullResponse, PushOutcome, PushRequest, RemoteApi};
use super::sync_model::SyncOperation;
use crate::entities::Entity;
use crate::errors::{Error, Result};

#[derive(Default)]
struct ServerState {
    entities: HashMap<String, Entity>,
    /// `(seq, id)` change log backing the pull cursor.
    log: Vec<(u64, String)>,
    next_seq: u64,
    pushes: Vec<PushRequest>,
    rejected_ids: BTreeSet<String>,
}

impl ServerState {
    fn record_change(&mut self, id: &str) {
        self.next_seq += 1;
        self.log.push((self.next_seq, id.to_string()));
    }
}

/// Versioned entity server with optional failure injection.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    page_size: Mutex<Option<usize>>,
    hold: Mutex<Option<Arc<Notify>>>,
    pub entered: Notify,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().expect("page size lock") = Some(size);
    }

    pub fn reject(&self, id: &str) {
        self.state
            .lock()
            .expect("state lock")
            .rejected_ids
            .insert(id.to_string());
    }

    /// Makes every push wait for a `notify_one` on the returned handle.
    pub fn hold_pushes(&self) -> Arc<Notify> {
        let hold = Arc::new(Notify::new());
        *self.hold.lock().expect("hold lock") = Some(hold.clone());
        hold
    }

    pub fn release_pushes(&self) {
        self.hold.lock().expect("hold lock").take();
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.state.lock().expect("state lock").entities.get(id).cloned()
    }

    pub fn entity_ids(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("state lock")
            .entities
            .keys()
            .cloned()
            .collect()
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state.lock().expect("state lock").pushes.clone()
    }

    /// Stores an entity as if another device had written it.
    pub fn seed(&self, mut entity: Entity) {
        entity.synced = false;
        let mut state = self.state.lock().expect("state lock");
        state.record_change(&entity.id);
        state.entities.insert(entity.id.clone(), entity);
    }

    pub fn hard_delete(&self, id: &str) {
        let mut state = self.state.lock().expect("state lock");
        state.entities.remove(id);
        state.record_change(id);
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let hold = self.hold.lock().expect("hold lock").clone();
        if let Some(hold) = hold {
            self.entered.notify_one();
            hold.notified().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transient("connection refused"));
        }

        let mut state = self.state.lock().expect("state lock");
        state.pushes.push(request.clone());
        if state.rejected_ids.contains(&request.entity_id) {
            return Ok(PushOutcome::Rejected {
                reason: "validation failed".to_string(),
            });
        }

        let current = state.entities.get(&request.entity_id).cloned();
        let outcome = match (request.operation, current) {
            (SyncOperation::Create, Some(existing)) => {
                if existing.deleted {
                    let mut revived = Entity::from_json(request.body.clone())?;
                    revived.version = existing.version + 1;
                    let version = revived.version;
                    state.entities.insert(revived.id.clone(), revived);
                    PushOutcome::Accepted {
                        version: Some(version),
                    }
                } else {
                    PushOutcome::Conflict {
                        server: Box::new(existing),
                    }
                }
            }
            (SyncOperation::Create, None) => {
                let mut created = Entity::from_json(request.body.clone())?;
                created.version = 1;
                state.entities.insert(created.id.clone(), created);
                PushOutcome::Accepted { version: Some(1) }
            }
            (SyncOperation::Update, Some(mut existing)) => {
                match request.expected_version {
                    Some(expected) if expected != existing.version => PushOutcome::Conflict {
                        server: Box::new(existing),
                    },
                    _ => {
                        existing.apply_patch(&request.body)?;
                        existing.version += 1;
                        let version = existing.version;
                        state.entities.insert(existing.id.clone(), existing);
                        PushOutcome::Accepted {
                            version: Some(version),
                        }
                    }
                }
            }
            (SyncOperation::Update, None) => PushOutcome::Rejected {
                reason: "not found".to_string(),
            },
            (SyncOperation::Delete, Some(mut existing)) => {
                existing.deleted = true;
                existing.version += 1;
                let version = existing.version;
                state.entities.insert(existing.id.clone(), existing);
                PushOutcome::Accepted {
                    version: Some(version),
                }
            }
            (SyncOperation::Delete, None) => PushOutcome::Accepted { version: None },
            (SyncOperation::PermanentDelete, _) => {
                state.entities.remove(&request.entity_id);
                PushOutcome::Accepted { version: None }
            }
        };
        if matches!(outcome, PushOutcome::Accepted { .. }) {
            state.record_change(&request.entity_id);
        }
        Ok(outcome)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transient("connection refused"));
        }
        let page_size = (*self.page_size.lock().expect("page size lock")).unwrap_or(usize::MAX);
        let since: u64 = request
            .since
            .as_deref()
            .and_then(|cursor| cursor.parse().ok())
            .unwrap_or(0);

        let state = self.state.lock().expect("state lock");
        let mut response = PullResponse::default();
        let mut last_seq = since;
        let mut taken = 0usize;
        for (seq, id) in state.log.iter().filter(|(seq, _)| *seq > since) {
            if taken == page_size {
                response.has_more = true;
                break;
            }
            last_seq = *seq;
            match state.entities.get(id) {
                Some(entity)
                    if entity.entity_type() == request.entity_type
                        && entity.workspace_id == request.workspace_id =>
                {
                    response.entities.retain(|existing: &Entity| &existing.id != id);
                    response.entities.push(entity.clone());
                    taken += 1;
                }
                Some(_) => {}
                None => {
                    response.removed.push(id.clone());
                    taken += 1;
                }
            }
        }
        response.cursor = Some(last_seq.to_string());
        Ok(response)
    }
}
