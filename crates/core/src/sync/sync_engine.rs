//! Sync Engine: drains the queue against the remote and pulls remote deltas back.
//!
//! One cycle walks `Idle -> Draining -> Pushing -> Pulling -> Reconciling -> Idle`.
//! A network failure ends the cycle in `Offline`; the background loop then
//! waits for the backoff delay or a connectivity signal before trying again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::Map;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use super::conflict_resolver::ConflictResolver;
use super::cursor_store::CursorStore;
use super::journal::Journal;
use super::remote::{PullRequest, PullResponse, PushOutcome, PushRequest, RemoteApi, RemoteChange};
use super::retry_policy::backoff_with_jitter;
use super::scheduler::SYNC_INTERVAL_JITTER_SECS;
use super::sync_model::{
    EnqueueRequest, FailureClass, QueueEntry, SyncCycleMetrics, SyncCycleTrigger, SyncOperation,
    SyncPhase, SyncStatus, SyncStatusSnapshot,
};
use super::sync_queue::SyncQueue;
use crate::config::SyncConfig;
use crate::entities::{Entity, EntityType};
use crate::errors::{Error, Result};
use crate::store::{LocalStore, WriteGate};

/// Grace period for the background task to release in-flight entries on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Wakes the sync engine after a local mutation.
pub trait SyncTrigger: Send + Sync {
    fn trigger(&self);
}

/// Trigger used when sync is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSyncTrigger;

impl SyncTrigger for NoOpSyncTrigger {
    fn trigger(&self) {}
}

/// Clears the in-flight-cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum PushStep {
    Continue,
    Offline(Error),
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct SyncEngine {
    /// Workspace pulled by this engine. Pushes drain the whole device queue.
    workspace_id: String,
    journal: Journal,
    remote: Arc<dyn RemoteApi>,
    cursors: Arc<dyn CursorStore>,
    gate: WriteGate,
    resolver: ConflictResolver,
    config: SyncConfig,
    cycle_running: AtomicBool,
    consecutive_failures: AtomicU32,
    wake: Notify,
    connectivity: Notify,
    shutdown_tx: watch::Sender<bool>,
    status_tx: watch::Sender<SyncStatusSnapshot>,
    background: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        workspace_id: impl Into<String>,
        journal: Journal,
        remote: Arc<dyn RemoteApi>,
        cursors: Arc<dyn CursorStore>,
        gate: WriteGate,
        config: SyncConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(SyncStatusSnapshot::default());
        Self {
            workspace_id: workspace_id.into(),
            resolver: ConflictResolver::new(journal.clone()),
            journal,
            remote,
            cursors,
            gate,
            config,
            cycle_running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            wake: Notify::new(),
            connectivity: Notify::new(),
            shutdown_tx,
            status_tx,
            background: AsyncMutex::new(None),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    fn store(&self) -> &Arc<dyn LocalStore> {
        self.journal.store()
    }

    fn queue(&self) -> &Arc<dyn SyncQueue> {
        self.journal.queue()
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status_tx.subscribe()
    }

    fn set_phase(&self, phase: SyncPhase) {
        let pending_count = self.queue().pending_count().unwrap_or_default();
        let failed_count = self
            .queue()
            .list_failed()
            .map(|items| items.len())
            .unwrap_or_default();
        let consecutive_failures = self.consecutive_failures.load(Ordering::Acquire);
        self.status_tx.send_modify(|snapshot| {
            snapshot.phase = phase;
            snapshot.status = phase.into();
            snapshot.pending_count = pending_count;
            snapshot.failed_count = failed_count;
            snapshot.consecutive_failures = consecutive_failures;
        });
    }

    /// Runs a sync cycle unless one is already in flight.
    ///
    /// Returns `Ok(None)` when the call was coalesced into the running cycle,
    /// which re-drains the queue before it finishes.
    pub async fn trigger_sync(
        &self,
        trigger: SyncCycleTrigger,
    ) -> Result<Option<SyncCycleMetrics>> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[Sync] Cycle already running, coalescing {:?} trigger", trigger);
            return Ok(None);
        }
        let _cycle = CycleGuard(&self.cycle_running);

        loop {
            let metrics = match self.run_cycle(trigger).await {
                Ok(metrics) => metrics,
                Err(err) => {
                    self.record_cycle_error(&err);
                    return Err(err);
                }
            };
            if metrics.status != "ok" || self.queue().pending_count()? == 0 {
                return Ok(Some(metrics));
            }
            debug!("[Sync] Entries were enqueued during the cycle, draining again");
        }
    }

    fn record_cycle_error(&self, err: &Error) {
        if matches!(err, Error::Cancelled) {
            info!("[Sync] Cycle cancelled");
            self.set_phase(SyncPhase::Idle);
            return;
        }
        error!("[Sync] Cycle failed: {}", err);
        self.set_phase(SyncPhase::Idle);
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = SyncStatus::Error;
            snapshot.last_error = Some(err.to_string());
        });
    }

    async fn run_cycle(&self, trigger: SyncCycleTrigger) -> Result<SyncCycleMetrics> {
        let started = Instant::now();
        let mut metrics = SyncCycleMetrics::default();
        debug!(
            "[Sync] Cycle started ({:?}) for workspace {}",
            trigger, self.workspace_id
        );
        self.set_phase(SyncPhase::Draining);

        loop {
            let batch = self.queue().dequeue_batch(self.config.batch_size)?;
            if batch.is_empty() {
                break;
            }
            self.set_phase(SyncPhase::Pushing);
            if let PushStep::Offline(err) = self.push_batch(&batch, &mut metrics).await? {
                return Ok(self.go_offline(err, metrics, started));
            }
        }

        self.set_phase(SyncPhase::Pulling);
        for entity_type in EntityType::ALL {
            match self.pull_entity_type(entity_type).await {
                Ok(applied) => metrics.pulled_count += applied,
                Err(err) if err.is_transient() => {
                    return Ok(self.go_offline(err, metrics, started));
                }
                Err(err) => return Err(err),
            }
        }

        self.set_phase(SyncPhase::Reconciling);
        self.consecutive_failures.store(0, Ordering::Release);
        metrics.duration_ms = started.elapsed().as_millis() as i64;
        metrics.status = "ok".to_string();
        info!(
            "[Sync] Cycle complete pushed={} pulled={} conflicts={} rejected={} in {}ms",
            metrics.pushed_count,
            metrics.pulled_count,
            metrics.conflict_count,
            metrics.rejected_count,
            metrics.duration_ms
        );
        self.status_tx.send_modify(|snapshot| {
            snapshot.last_error = None;
            snapshot.last_sync_at = Some(Utc::now());
            snapshot.last_cycle = Some(metrics.clone());
        });
        self.set_phase(SyncPhase::Idle);
        Ok(metrics)
    }

    fn go_offline(
        &self,
        err: Error,
        mut metrics: SyncCycleMetrics,
        started: Instant,
    ) -> SyncCycleMetrics {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "[Sync] Remote unreachable ({}), offline after {} consecutive failure(s)",
            err, failures
        );
        metrics.duration_ms = started.elapsed().as_millis() as i64;
        metrics.status = "offline".to_string();
        self.status_tx.send_modify(|snapshot| {
            snapshot.last_error = Some(err.to_string());
            snapshot.last_cycle = Some(metrics.clone());
        });
        self.set_phase(SyncPhase::Offline);
        metrics
    }

    /// Races `future` against shutdown. A cancelled call never applies its result.
    async fn cancellable<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Err(Error::Cancelled),
            result = future => result,
        }
    }

    async fn push_batch(
        &self,
        batch: &[QueueEntry],
        metrics: &mut SyncCycleMetrics,
    ) -> Result<PushStep> {
        for (index, entry) in batch.iter().enumerate() {
            let step = self.push_entry(entry.clone(), metrics).await;
            if !matches!(step, Ok(PushStep::Continue)) {
                for rest in &batch[index + 1..] {
                    self.queue().release(rest.seq)?;
                }
                return step;
            }
        }
        Ok(PushStep::Continue)
    }

    /// Builds the remote request for an entry, or `None` when it must not be sent.
    ///
    /// Creates and updates of an entity that is currently local-only (or was
    /// purged since) are dropped; deletes are always sent.
    fn build_push_request(&self, entry: &QueueEntry) -> Result<Option<PushRequest>> {
        let (body, expected_version) = match entry.operation {
            SyncOperation::Create | SyncOperation::Update => {
                let Some(entity) = self
                    .store()
                    .get(&entry.entity_id)?
                    .filter(|entity| !entity.is_local_only())
                else {
                    return Ok(None);
                };
                if entry.operation == SyncOperation::Create {
                    (entity.to_remote_json()?, None)
                } else {
                    let expected = (!entry.skip_conflict_check).then_some(entity.version);
                    (entry.payload.clone(), expected)
                }
            }
            SyncOperation::Delete | SyncOperation::PermanentDelete => (Map::new(), None),
        };
        Ok(Some(PushRequest {
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            body,
            expected_version,
        }))
    }

    async fn push_entry(
        &self,
        entry: QueueEntry,
        metrics: &mut SyncCycleMetrics,
    ) -> Result<PushStep> {
        let seq = entry.seq;
        let request = match self.build_push_request(&entry) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(
                    "[Sync] Dropping {} for {} {}: entity is local-only or gone",
                    entry.operation.as_str(),
                    entry.entity_type,
                    entry.entity_id
                );
                self.queue().drop_entry(seq)?;
                return Ok(PushStep::Continue);
            }
            Err(err) => {
                self.queue().release(seq)?;
                return Err(err);
            }
        };

        debug!(
            "[Sync] Pushing {} {} {} (expected version {:?})",
            request.operation.as_str(),
            request.entity_type,
            request.entity_id,
            request.expected_version
        );
        let outcome = self.cancellable(self.remote.push(request)).await;

        match outcome {
            Ok(PushOutcome::Accepted { version }) => {
                self.apply_accepted(&entry, version)?;
                metrics.pushed_count += 1;
            }
            Ok(PushOutcome::Conflict { server }) => {
                self.apply_conflict(entry, *server)?;
                metrics.conflict_count += 1;
            }
            Ok(PushOutcome::Rejected { reason }) | Err(Error::PermanentRejection(reason)) => {
                self.park(entry, reason, FailureClass::Permanent)?;
                metrics.rejected_count += 1;
            }
            Err(err) if err.is_transient() => {
                if entry.attempts + 1 >= self.config.max_push_attempts {
                    self.park(entry, err.to_string(), FailureClass::Transient)?;
                } else {
                    self.queue().requeue(seq)?;
                }
                return Ok(PushStep::Offline(err));
            }
            Err(err) => {
                self.queue().release(seq)?;
                return Err(err);
            }
        }
        Ok(PushStep::Continue)
    }

    fn apply_accepted(&self, entry: &QueueEntry, version: Option<i64>) -> Result<()> {
        let _gate = self.gate.lock()?;
        self.queue().drop_entry(entry.seq)?;
        let still_pending = self
            .queue()
            .has_pending(entry.entity_type, &entry.entity_id)?;

        self.store().update(&entry.entity_id, &mut |entity: &mut Entity| {
            match version {
                // The server moved further than this write explains; leave the
                // version behind so the pull refreshes the entity.
                Some(version) if version > entity.version + 1 => {}
                Some(version) => {
                    entity.version = entity.version.max(version);
                    entity.synced = !still_pending;
                }
                None => entity.synced = !still_pending,
            }
        })?;
        debug!(
            "[Sync] {} {} {} accepted (version {:?})",
            entry.operation.as_str(),
            entry.entity_type,
            entry.entity_id,
            version
        );
        Ok(())
    }

    fn apply_conflict(&self, entry: QueueEntry, server: Entity) -> Result<()> {
        let _gate = self.gate.lock()?;
        match self.resolver.resolve(&entry, server, Utc::now()) {
            Ok(resolution) => {
                self.queue().drop_entry(entry.seq)?;
                if let Some(fork) = resolution.fork {
                    debug!(
                        "[Sync] Conflict on {} {} preserved as {}",
                        entry.entity_type, entry.entity_id, fork.id
                    );
                }
                Ok(())
            }
            Err(Error::InvariantViolation(reason)) => {
                error!("[Sync] {}", reason);
                self.park(entry, reason, FailureClass::Permanent)
            }
            Err(err) => {
                self.queue().release(entry.seq)?;
                Err(err)
            }
        }
    }

    /// Moves an entry out of the queue into the failed-items list.
    fn park(&self, entry: QueueEntry, reason: String, class: FailureClass) -> Result<()> {
        warn!(
            "[Sync] {} {} {} failed ({}): {}",
            entry.operation.as_str(),
            entry.entity_type,
            entry.entity_id,
            class.as_str(),
            reason
        );
        self.queue().drop_entry(entry.seq)?;
        self.queue().record_failure(entry, reason, class)
    }

    async fn pull_entity_type(&self, entity_type: EntityType) -> Result<usize> {
        let mut since = self.cursors.get_cursor(&self.workspace_id, entity_type)?;
        let mut applied = 0;
        loop {
            let request = PullRequest {
                entity_type,
                workspace_id: self.workspace_id.clone(),
                since: since.clone(),
            };
            let PullResponse {
                entities,
                removed,
                cursor,
                has_more,
            } = self.cancellable(self.remote.pull(request)).await?;
            applied += self.apply_pulled(entity_type, entities, &removed)?;

            match cursor {
                Some(next) if since.as_deref() != Some(next.as_str()) => {
                    self.cursors
                        .set_cursor(&self.workspace_id, entity_type, &next)?;
                    since = Some(next);
                }
                _ => {
                    if has_more {
                        warn!(
                            "[Sync] Remote reported more {} changes without advancing the cursor",
                            entity_type
                        );
                    }
                    break;
                }
            }
            if !has_more {
                break;
            }
        }
        Ok(applied)
    }

    fn apply_pulled(
        &self,
        entity_type: EntityType,
        entities: Vec<Entity>,
        removed: &[String],
    ) -> Result<usize> {
        let _gate = self.gate.lock()?;
        let now = Utc::now();
        let mut applied = 0;
        for entity in entities {
            if self.apply_remote_entity(entity, now)? {
                applied += 1;
            }
        }
        for id in removed {
            if self.apply_remote_removal(entity_type, id)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Applies one remote copy. Pending local intent and newer local versions win.
    /// The caller holds the `WriteGate`.
    fn apply_remote_entity(&self, entity: Entity, now: DateTime<Utc>) -> Result<bool> {
        if entity.workspace_id != self.workspace_id {
            return Ok(false);
        }
        let entity_type = entity.entity_type();
        if self.queue().has_pending(entity_type, &entity.id)? {
            debug!(
                "[Sync] Keeping pending local intent for {} {}",
                entity_type, entity.id
            );
            return Ok(false);
        }
        if let Some(local) = self.store().get(&entity.id)? {
            if local.is_local_only() {
                debug!(
                    "[Sync] Ignoring remote copy of local-only {} {}",
                    entity_type, entity.id
                );
                return Ok(false);
            }
            if local.version >= entity.version {
                return Ok(false);
            }
        }

        let mut incoming = entity;
        incoming.synced = true;
        incoming.last_modified = now;
        self.store().put(incoming)?;
        Ok(true)
    }

    fn apply_remote_removal(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        if self.queue().has_pending(entity_type, id)? {
            return Ok(false);
        }
        match self.store().get(id)? {
            Some(local) if local.entity_type() == entity_type && !local.is_local_only() => {
                self.store().delete(id)?;
                debug!("[Sync] Removed {} {} deleted remotely", entity_type, id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Applies a change pushed by a realtime channel through the pull path.
    pub fn apply_remote_change(&self, change: RemoteChange) -> Result<bool> {
        let _gate = self.gate.lock()?;
        match change {
            RemoteChange::Upserted(entity) => self.apply_remote_entity(*entity, Utc::now()),
            RemoteChange::Removed { entity_type, id } => {
                self.apply_remote_removal(entity_type, &id)
            }
        }
    }

    /// Re-enqueues entries that failed for transient reasons. Permanent
    /// rejections stay in the failed-items list.
    pub fn retry_failed_items(&self) -> Result<usize> {
        let retried = {
            let _gate = self.gate.lock()?;
            let items = self.queue().take_failed(FailureClass::Transient)?;
            let mut retried = 0;
            for item in items {
                let entry = item.entry;
                let payload = match entry.operation {
                    SyncOperation::Update => {
                        // Re-read the fields so a stale payload never overwrites newer edits.
                        let Some(current) = self.store().get(&entry.entity_id)? else {
                            continue;
                        };
                        let current = current.to_json()?;
                        entry
                            .payload
                            .keys()
                            .filter_map(|key| {
                                current.get(key).map(|value| (key.clone(), value.clone()))
                            })
                            .collect()
                    }
                    _ => entry.payload,
                };
                self.queue().enqueue(
                    EnqueueRequest::new(
                        entry.entity_type,
                        entry.entity_id,
                        entry.operation,
                        payload,
                    )
                    .with_skip_conflict_check(entry.skip_conflict_check),
                )?;
                retried += 1;
            }
            retried
        };
        info!("[Sync] Re-enqueued {} failed item(s)", retried);
        let phase = self.status_tx.borrow().phase;
        self.set_phase(phase);
        if retried > 0 {
            self.wake.notify_one();
        }
        Ok(retried)
    }

    /// Signals that the network is reachable again.
    pub fn connectivity_restored(&self) {
        info!("[Sync] Connectivity restored");
        self.connectivity.notify_one();
    }

    fn periodic_delay(&self) -> Duration {
        let jitter_bound = SYNC_INTERVAL_JITTER_SECS.saturating_mul(1_000);
        let jitter_ms = if jitter_bound > 0 {
            rand::thread_rng().gen_range(0..jitter_bound)
        } else {
            0
        };
        Duration::from_secs(self.config.sync_interval_secs) + Duration::from_millis(jitter_ms)
    }

    /// Spawns the background loop. Entries left in flight by a previous run
    /// are returned to the queue first.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.background.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
            guard.take();
        }

        if !self.cycle_running.load(Ordering::Acquire) {
            let recovered = self.queue().recover_in_flight()?;
            if recovered > 0 {
                info!("[Sync] Recovered {} in-flight queue entries", recovered);
            }
        }

        self.shutdown_tx.send_replace(false);
        let engine = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { engine.run_loop().await }));
        info!(
            "[Sync] Background engine started for workspace {}",
            self.workspace_id
        );
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut trigger = SyncCycleTrigger::Startup;
        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                break;
            }
            match self.trigger_sync(trigger).await {
                Ok(Some(metrics)) => debug!(
                    "[Sync] Background cycle status={} pushed={} pulled={}",
                    metrics.status, metrics.pushed_count, metrics.pulled_count
                ),
                Ok(None) => {}
                Err(Error::Cancelled) => break,
                Err(err) => warn!("[Sync] Background cycle failed: {}", err),
            }

            let offline = self.status_tx.borrow().phase == SyncPhase::Offline;
            trigger = if offline {
                let failures = self.consecutive_failures.load(Ordering::Acquire);
                let delay = backoff_with_jitter(failures.saturating_sub(1));
                debug!("[Sync] Offline, next attempt in {:?}", delay);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => SyncCycleTrigger::Periodic,
                    _ = self.connectivity.notified() => SyncCycleTrigger::ConnectivityRestored,
                }
            } else {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.periodic_delay()) => SyncCycleTrigger::Periodic,
                    _ = self.wake.notified() => SyncCycleTrigger::LocalMutation,
                    _ = self.connectivity.notified() => SyncCycleTrigger::ConnectivityRestored,
                }
            };
        }
        info!("[Sync] Background engine stopped");
    }

    /// Cancels in-flight network calls and stops the background loop.
    ///
    /// Cancelled pushes return their entries to the queue untouched.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.background.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("[Sync] Background engine did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl SyncTrigger for SyncEngine {
    fn trigger(&self) {
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CardFields, CardType, EntityBody};
    use crate::store::MemoryStore;
    use crate::sync::test_support::FakeRemote;
    use crate::sync::{LocalOnlyFields, MemoryCursorStore, MemorySyncQueue, SyncStatus};

    struct Device {
        store: Arc<MemoryStore>,
        queue: Arc<MemorySyncQueue>,
        cursors: Arc<MemoryCursorStore>,
        journal: Journal,
        gate: WriteGate,
        engine: Arc<SyncEngine>,
    }

    fn device_with(remote: &Arc<FakeRemote>, config: SyncConfig) -> Device {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemorySyncQueue::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let journal = Journal::new(store.clone(), queue.clone(), LocalOnlyFields::default());
        let gate = WriteGate::new();
        let engine = Arc::new(SyncEngine::new(
            "ws-1",
            journal.clone(),
            remote.clone(),
            cursors.clone(),
            gate.clone(),
            config,
        ));
        Device {
            store,
            queue,
            cursors,
            journal,
            gate,
            engine,
        }
    }

    fn device(remote: &Arc<FakeRemote>) -> Device {
        device_with(remote, SyncConfig::default())
    }

    fn note(title: &str) -> Entity {
        Entity::new(
            "ws-1",
            EntityBody::Card(CardFields::new(CardType::Note, title)),
            Utc::now(),
        )
    }

    fn title_of(entity: &Entity) -> &str {
        &entity.as_card().expect("card").title
    }

    impl Device {
        fn create(&self, title: &str) -> Entity {
            let _gate = self.gate.lock().expect("gate");
            self.journal.record_create(note(title)).expect("create")
        }

        fn edit(&self, id: &str, apply: impl FnOnce(&mut Entity)) -> Entity {
            let _gate = self.gate.lock().expect("gate");
            let before = self.store.get(id).expect("get").expect("exists");
            let mut after = before.clone();
            apply(&mut after);
            after.touch(Utc::now());
            self.journal.record_update(&before, after).expect("update")
        }

        fn get(&self, id: &str) -> Entity {
            self.store.get(id).expect("get").expect("exists")
        }

        async fn sync(&self) -> SyncCycleMetrics {
            self.engine
                .trigger_sync(SyncCycleTrigger::Manual)
                .await
                .expect("sync")
                .expect("cycle ran")
        }
    }

    #[tokio::test]
    async fn accepted_create_marks_entity_synced() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let card = device.create("Hello");

        let metrics = device.sync().await;

        assert_eq!(metrics.pushed_count, 1);
        assert_eq!(metrics.status, "ok");
        let stored = device.get(&card.id);
        assert!(stored.synced);
        assert_eq!(stored.version, 1);
        assert!(remote.entity(&card.id).is_some());
        assert_eq!(device.queue.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn concurrent_edits_on_two_devices_fork_the_later_one() {
        let remote = FakeRemote::new();
        let laptop = device(&remote);
        let phone = device(&remote);
        let card = laptop.create("Card A");
        laptop.sync().await;
        phone.sync().await;
        assert_eq!(title_of(&phone.get(&card.id)), "Card A");

        laptop.edit(&card.id, |entity| {
            entity.as_card_mut().expect("card").title = "Laptop title".to_string();
        });
        phone.edit(&card.id, |entity| {
            entity.as_card_mut().expect("card").title = "Phone title".to_string();
        });

        laptop.sync().await;
        assert_eq!(remote.entity(&card.id).expect("server").version, 2);
        let metrics = phone.sync().await;
        assert_eq!(metrics.conflict_count, 1);

        let canonical = phone.get(&card.id);
        assert_eq!(title_of(&canonical), "Laptop title");
        assert_eq!(canonical.version, 2);
        assert!(canonical.synced);

        let forks = phone
            .store
            .query("ws-1", &|entity: &Entity| entity.is_conflicted())
            .expect("query");
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].conflict_with_id.as_deref(), Some(card.id.as_str()));
        assert_eq!(title_of(&forks[0]), "Phone title");
        assert!(forks[0].synced, "fork is pushed in the same cycle");
        assert!(remote.entity(&forks[0].id).is_some());
    }

    #[tokio::test]
    async fn local_only_update_skips_version_check() {
        let remote = FakeRemote::new();
        let laptop = device(&remote);
        let phone = device(&remote);
        let card = laptop.create("Card A");
        laptop.sync().await;
        phone.sync().await;

        laptop.edit(&card.id, |entity| {
            entity.as_card_mut().expect("card").title = "Renamed".to_string();
        });
        laptop.sync().await;
        phone.edit(&card.id, |entity| {
            entity
                .as_card_mut()
                .expect("card")
                .tags
                .insert("reading".to_string());
        });

        let metrics = phone.sync().await;

        assert_eq!(metrics.conflict_count, 0);
        let pushed = remote.pushes();
        let tag_push = pushed.last().expect("tag push");
        assert_eq!(tag_push.expected_version, None);

        let merged = phone.get(&card.id);
        assert_eq!(title_of(&merged), "Renamed");
        assert!(merged.as_card().expect("card").tags.contains("reading"));
        assert_eq!(merged.version, 3);
    }

    #[tokio::test]
    async fn pending_local_intent_wins_over_remote_change() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let card = device.create("Mine");
        device.sync().await;
        device.edit(&card.id, |entity| {
            entity.as_card_mut().expect("card").title = "Edited offline".to_string();
        });

        let mut theirs = device.get(&card.id);
        theirs.version = 5;
        theirs.as_card_mut().expect("card").title = "Theirs".to_string();
        let applied = device
            .engine
            .apply_remote_change(RemoteChange::Upserted(Box::new(theirs)))
            .expect("apply");

        assert!(!applied);
        assert_eq!(title_of(&device.get(&card.id)), "Edited offline");
    }

    #[tokio::test]
    async fn stale_remote_versions_never_move_local_version_back() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let mut local = note("v3");
        local.version = 3;
        local.synced = true;
        device.store.put(local.clone()).expect("put");

        let mut stale = local.clone();
        stale.version = 2;
        stale.as_card_mut().expect("card").title = "v2".to_string();
        assert!(!device
            .engine
            .apply_remote_change(RemoteChange::Upserted(Box::new(stale)))
            .expect("apply"));
        assert_eq!(device.get(&local.id).version, 3);

        let mut newer = local.clone();
        newer.version = 4;
        newer.as_card_mut().expect("card").title = "v4".to_string();
        assert!(device
            .engine
            .apply_remote_change(RemoteChange::Upserted(Box::new(newer)))
            .expect("apply"));
        let stored = device.get(&local.id);
        assert_eq!(stored.version, 4);
        assert_eq!(title_of(&stored), "v4");
    }

    #[tokio::test]
    async fn rejected_entries_are_parked_and_not_retried() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let card = device.create("Invalid");
        remote.reject(&card.id);

        let metrics = device.sync().await;

        assert_eq!(metrics.rejected_count, 1);
        assert_eq!(device.queue.pending_count().expect("count"), 0);
        let failed = device.queue.list_failed().expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].class, FailureClass::Permanent);
        assert_eq!(device.engine.retry_failed_items().expect("retry"), 0);
        assert_eq!(device.queue.pending_count().expect("count"), 0);
        assert_eq!(device.engine.status().failed_count, 1);
    }

    #[tokio::test]
    async fn network_failure_goes_offline_and_keeps_the_entry() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let card = device.create("Offline");
        remote.set_offline(true);

        let metrics = device.sync().await;

        assert_eq!(metrics.status, "offline");
        let status = device.engine.status();
        assert_eq!(status.status, SyncStatus::Offline);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        let entries = device.queue.list().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);
        assert!(!entries[0].in_flight);

        remote.set_offline(false);
        let metrics = device.sync().await;
        assert_eq!(metrics.pushed_count, 1);
        assert!(device.get(&card.id).synced);
        assert_eq!(device.engine.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_retryable_on_demand() {
        let remote = FakeRemote::new();
        let config = SyncConfig {
            max_push_attempts: 1,
            ..SyncConfig::default()
        };
        let device = device_with(&remote, config);
        let card = device.create("Flaky");
        remote.set_offline(true);
        device.sync().await;

        assert_eq!(device.queue.pending_count().expect("count"), 0);
        let failed = device.queue.list_failed().expect("failed");
        assert_eq!(failed[0].class, FailureClass::Transient);

        remote.set_offline(false);
        assert_eq!(device.engine.retry_failed_items().expect("retry"), 1);
        device.sync().await;
        assert!(remote.entity(&card.id).is_some());
        assert!(device.queue.list_failed().expect("failed").is_empty());
    }

    #[tokio::test]
    async fn local_only_entities_are_not_pushed() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        let card = device.create("Secret");
        device
            .store
            .update(&card.id, &mut |entity: &mut Entity| {
                if let Some(fields) = entity.as_card_mut() {
                    fields.is_private = true;
                    fields.is_local_only = true;
                }
            })
            .expect("update");

        device.sync().await;

        assert!(remote.pushes().is_empty());
        assert_eq!(device.queue.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce_into_one_cycle() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        device.create("First");
        let hold = remote.hold_pushes();

        let engine = device.engine.clone();
        let running =
            tokio::spawn(async move { engine.trigger_sync(SyncCycleTrigger::Manual).await });
        remote.entered.notified().await;

        let coalesced = device
            .engine
            .trigger_sync(SyncCycleTrigger::LocalMutation)
            .await
            .expect("trigger");
        assert!(coalesced.is_none());

        device.create("Second");
        remote.release_pushes();
        hold.notify_one();

        let metrics = running
            .await
            .expect("join")
            .expect("sync")
            .expect("cycle ran");
        assert_eq!(metrics.pushed_count, 2);
        assert_eq!(remote.entity_ids().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_push_and_keeps_entry_intact() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        device.create("Interrupted");
        let _hold = remote.hold_pushes();

        let engine = device.engine.clone();
        let running =
            tokio::spawn(async move { engine.trigger_sync(SyncCycleTrigger::Manual).await });
        remote.entered.notified().await;
        device.engine.shutdown().await;

        let result = running.await.expect("join");
        assert!(matches!(result, Err(Error::Cancelled)));
        let entries = device.queue.list().expect("list");
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].in_flight);
        assert_eq!(entries[0].attempts, 0);
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test]
    async fn pull_follows_pages_and_applies_removals() {
        let remote = FakeRemote::new();
        remote.set_page_size(2);
        let ids: Vec<String> = ["one", "two", "three"]
            .into_iter()
            .map(|title| {
                let entity = note(title);
                let id = entity.id.clone();
                remote.seed(entity);
                id
            })
            .collect();
        let device = device(&remote);

        let metrics = device.sync().await;

        assert_eq!(metrics.pulled_count, 3);
        for id in &ids {
            assert!(device.get(id).synced);
        }
        assert_eq!(
            device
                .cursors
                .get_cursor("ws-1", EntityType::Card)
                .expect("cursor")
                .as_deref(),
            Some("3")
        );

        remote.hard_delete(&ids[0]);
        let metrics = device.sync().await;
        assert_eq!(metrics.pulled_count, 1);
        assert!(device.store.get(&ids[0]).expect("get").is_none());
    }

    #[tokio::test]
    async fn background_loop_pushes_after_trigger() {
        let remote = FakeRemote::new();
        let device = device(&remote);
        device.engine.start().await.expect("start");

        let card = device.create("Background");
        device.engine.trigger();

        let mut pushed = false;
        for _ in 0..200 {
            if remote.entity(&card.id).is_some() {
                pushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        device.engine.shutdown().await;

        assert!(pushed);
        let status = device.engine.subscribe_status().borrow().clone();
        assert_eq!(status.status, SyncStatus::Idle);
        assert!(status.last_sync_at.is_some());
    }
}
