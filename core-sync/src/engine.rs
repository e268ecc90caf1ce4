//! # Sync Engine
//!
//! Drains the local change queue into the household's remote store, detects
//! concurrent remote writes and surfaces them as conflicts.
//!
//! ## Overview
//!
//! One [`SyncEngine`] exists per signed-in household session. It is
//! constructed explicitly, started with [`SyncEngine::start_sync`] at login
//! and stopped with [`SyncEngine::stop`] at logout. Cloning the engine is
//! cheap; clones share all state.
//!
//! ## Drain
//!
//! A drain walks the pending entries oldest first. Each entry gets exactly one
//! conditional remote write bounded by `operation_timeout`:
//!
//! - applied: the entry is confirmed (`synced`)
//! - version mismatch: the [`ConflictResolver`] decides; conflicts are parked
//!   and the drain moves on
//! - transient failure: the attempt is counted and the drain stops early so a
//!   struggling remote is not hammered; the budget exhausted, the entry fails
//!   and the drain continues
//! - rejection: the entry fails immediately and the drain continues
//!
//! Only one drain runs at a time. A request arriving while a drain is in
//! flight is folded into a single follow-up pass.
//!
//! ## Triggers
//!
//! `start_sync`, `sync_now`, the periodic timer, connectivity returning, and
//! `retry_failed`. No drain runs while offline.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncEngine, SyncEngineConfig, Operation};
//!
//! let engine = SyncEngine::new(SyncEngineConfig::default(), queue, remote, network);
//! engine.start_sync("household-1", "user-7").await?;
//!
//! engine
//!     .enqueue("asset", "A1", Operation::Update, json!({ "name": "Car" }), Some(3))
//!     .await?;
//! engine.sync_now().await?;
//! ```

use bridge_traits::{Clock, NetworkMonitor, RemoteChange, RemoteStore, SystemClock, WriteOutcome};
use chrono::{DateTime, Utc};
use core_runtime::config::SyncSettings;
use core_runtime::events::{
    CoreEvent, EventBus, ListenerHandle, QueueEvent, Receiver, SyncEvent,
};
use lru::LruCache;
use serde_json::Value;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::change::{ChangeId, ChangeStatus, NewChange, Operation, PendingChange};
use crate::conflict_resolver::{ConflictResolver, Resolution};
use crate::error::{Result, SyncError};
use crate::repository::{ApplyOutcome, EnqueueResult, PendingChangesRepository};
use crate::state::SyncState;

/// Recently written `(record, version)` pairs remembered to tell our own
/// writes apart from other devices' in the remote change feed
const DEFAULT_OWN_WRITE_CACHE: usize = 256;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Push attempts per entry before it is marked `failed`
    pub max_attempts: u32,
    /// Bound on every remote call and connectivity probe
    pub operation_timeout: Duration,
    /// Periodic drain interval; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Delete `synced` rows after each drain
    pub purge_synced: bool,
    pub own_write_cache: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncEngineConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            operation_timeout: settings.operation_timeout,
            sync_interval: settings.sync_interval,
            purge_synced: settings.purge_synced,
            own_write_cache: DEFAULT_OWN_WRITE_CACHE,
        }
    }
}

/// Tally of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub run_id: String,
    /// Entries confirmed by the remote store
    pub synced: u64,
    /// Entries whose write landed but were edited meanwhile; pushed again
    pub rebased: u64,
    pub conflicts: u64,
    pub failed: u64,
    /// Stopped early by a transient failure; remaining entries untouched
    pub deferred: bool,
    /// Stopped early by [`SyncEngine::stop`]
    pub interrupted: bool,
}

impl DrainReport {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }
}

/// What a drain request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A pass ran (possibly followed by queued-after passes; this is the last)
    Completed(DrainReport),
    /// Another drain was in flight; it will run one more pass
    Coalesced,
    /// No connectivity; nothing was attempted
    SkippedOffline,
}

/// Household the engine syncs for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub household_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Synced,
    Rebased,
    Conflict,
    Failed,
    Deferred,
    Skipped,
}

#[derive(Default)]
struct Lifecycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Offline-first sync engine
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncEngineConfig>,
    queue: Arc<PendingChangesRepository>,
    remote: Arc<dyn RemoteStore>,
    network: Arc<dyn NetworkMonitor>,
    resolver: ConflictResolver,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    state: Arc<StdMutex<SyncState>>,
    is_online: Arc<AtomicBool>,
    last_sync_time: Arc<StdRwLock<Option<DateTime<Utc>>>>,
    session: Arc<StdRwLock<Option<SyncSession>>>,
    drain_lock: Arc<Mutex<()>>,
    rerun: Arc<AtomicBool>,
    own_writes: Arc<StdMutex<LruCache<(bridge_traits::RecordKey, u64), ()>>>,
    lifecycle: Arc<StdMutex<Lifecycle>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncEngineConfig,
        queue: Arc<PendingChangesRepository>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.own_write_cache).unwrap_or(NonZeroUsize::MIN);

        Self {
            config: Arc::new(config),
            queue,
            remote,
            network,
            resolver: ConflictResolver::new(),
            event_bus: EventBus::default(),
            clock: Arc::new(SystemClock),
            state: Arc::new(StdMutex::new(SyncState::Idle)),
            is_online: Arc::new(AtomicBool::new(false)),
            last_sync_time: Arc::new(StdRwLock::new(None)),
            session: Arc::new(StdRwLock::new(None)),
            drain_lock: Arc::new(Mutex::new(())),
            rerun: Arc::new(AtomicBool::new(false)),
            own_writes: Arc::new(StdMutex::new(LruCache::new(cache_size))),
            lifecycle: Arc::new(StdMutex::new(Lifecycle::default())),
        }
    }

    /// Use `clock` for `last_sync_time` and event timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin syncing for a household session.
    ///
    /// Recovers entries interrupted by a previous crash, starts the
    /// connectivity, remote-change and timer watchers, then probes
    /// connectivity: offline, the engine parks in `offline`; online, the first
    /// drain runs before this returns. Calling it again restarts the session.
    #[instrument(skip(self), fields(household_id = %household_id))]
    pub async fn start_sync(&self, household_id: &str, user_id: &str) -> Result<DrainOutcome> {
        if household_id.is_empty() {
            return Err(SyncError::InvalidOperation(
                "household_id must not be empty".to_string(),
            ));
        }

        self.stop_watchers();
        // A drain from the previous session finishes its entry before the
        // queue is recovered
        drop(self.drain_lock.lock().await);
        *self.write_session() = Some(SyncSession {
            household_id: household_id.to_string(),
            user_id: user_id.to_string(),
        });

        self.queue.recover_interrupted().await?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.extend(self.spawn_network_watcher(cancel.clone()).await);
        tasks.extend(self.spawn_remote_watcher(cancel.clone()).await);
        tasks.extend(self.spawn_timer(cancel.clone()));

        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            *lifecycle = Lifecycle { cancel, tasks };
        }

        info!(user_id = %user_id, "Sync session started");

        if !self.refresh_connectivity().await {
            self.enter_offline();
            return Ok(DrainOutcome::SkippedOffline);
        }

        self.sync_now().await
    }

    /// End the session: watchers and the timer stop, an in-flight entry
    /// finishes but no further entry starts.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.stop_watchers();
        *self.write_session() = None;
        self.rerun.store(false, Ordering::SeqCst);

        // Wait for an in-flight drain to wind down
        let _guard = self.drain_lock.lock().await;
        info!("Sync session stopped");
    }

    /// Signal watchers and the timer to stop. Tasks are not aborted: the
    /// timer may be running a drain, which has to settle its current entry.
    fn stop_watchers(&self) {
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            lifecycle.cancel.cancel();
            lifecycle.tasks.clear();
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.lifecycle
            .lock()
            .map(|lifecycle| lifecycle.cancel.clone())
            .unwrap_or_else(|e| e.into_inner().cancel.clone())
    }

    async fn spawn_network_watcher(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut changes = match self.network.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Connectivity changes unavailable; relying on probes");
                return None;
            }
        };

        let engine = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    info = changes.next() => match info {
                        Some(info) => engine.handle_connectivity(info.is_online()),
                        None => break,
                    },
                }
            }
            debug!("Connectivity watcher stopped");
        }))
    }

    async fn spawn_remote_watcher(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut changes = match self.remote.subscribe_changes().await {
            Ok(Some(changes)) => changes,
            Ok(None) => {
                debug!("Remote store has no change feed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to remote changes");
                return None;
            }
        };

        let engine = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.next() => match change {
                        Some(change) => engine.handle_remote_change(change),
                        None => break,
                    },
                }
            }
            debug!("Remote change watcher stopped");
        }))
    }

    fn spawn_timer(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.sync_interval?;
        let engine = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sync_now().await {
                            warn!(error = %e, "Periodic sync failed");
                        }
                    }
                }
            }
        }))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Queue a local mutation for the current household.
    ///
    /// Does not trigger a drain; callers batch edits and call
    /// [`sync_now`](Self::sync_now) or wait for the timer.
    #[instrument(skip(self, payload), fields(operation = %operation))]
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
        base_version: Option<u64>,
    ) -> Result<EnqueueResult> {
        let session = self.session().ok_or(SyncError::NotStarted)?;

        let result = self
            .queue
            .enqueue(NewChange {
                household_id: session.household_id,
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                operation,
                payload,
                base_version,
            })
            .await?;

        self.emit(CoreEvent::Queue(QueueEvent::ChangeQueued {
            change_id: result.id.value(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: result.operation.as_str().to_string(),
            coalesced: result.coalesced,
        }));

        Ok(result)
    }

    /// Drain the queue now.
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.process_pending_changes().await
    }

    /// Run a drain unless one is already running, in which case one more pass
    /// is scheduled after it.
    pub async fn process_pending_changes(&self) -> Result<DrainOutcome> {
        if self.session().is_none() {
            return Err(SyncError::NotStarted);
        }

        let mut previous = None;
        loop {
            let guard = match self.drain_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.rerun.store(true, Ordering::SeqCst);
                    // The holder may have released between the two attempts
                    match self.drain_lock.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            debug!("Drain already running; scheduled a follow-up pass");
                            return Ok(previous.unwrap_or(DrainOutcome::Coalesced));
                        }
                    }
                }
            };

            let outcome = self.drain_until_settled().await;
            drop(guard);
            let outcome = outcome?;

            // A request landing after the last check but before the release
            if !Self::accepts_follow_up(&outcome) || !self.rerun.load(Ordering::SeqCst) {
                return Ok(outcome);
            }
            debug!("Follow-up requested while releasing the drain lock");
            previous = Some(outcome);
        }
    }

    async fn drain_until_settled(&self) -> Result<DrainOutcome> {
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let outcome = self.drain_pass().await?;

            if !Self::accepts_follow_up(&outcome) || !self.rerun.load(Ordering::SeqCst) {
                return Ok(outcome);
            }
            debug!("Running follow-up drain pass");
        }
    }

    fn accepts_follow_up(outcome: &DrainOutcome) -> bool {
        matches!(outcome, DrainOutcome::Completed(report) if !report.deferred && !report.interrupted)
    }

    /// Settle a conflict. Keeping the local side reads the record's current
    /// version first, so it needs connectivity.
    ///
    /// Returns the id of the re-queued entry when the local value was kept.
    #[instrument(skip(self), fields(change_id = %change_id))]
    pub async fn resolve_conflict_manually(
        &self,
        change_id: ChangeId,
        use_remote: bool,
    ) -> Result<Option<ChangeId>> {
        let change = self
            .queue
            .get(change_id)
            .await?
            .ok_or(SyncError::ChangeNotFound(change_id.value()))?;

        if change.status != ChangeStatus::Conflict {
            return Err(SyncError::InvalidStatus(format!(
                "change {} is {}, not conflict",
                change_id, change.status
            )));
        }

        let current_version = if use_remote {
            None
        } else {
            self.remote_call(self.remote.read_current_version(&change.key()))
                .await?
                .map(|record| record.version)
        };

        let requeued = self
            .queue
            .resolve_conflict(change_id, use_remote, current_version)
            .await?;

        self.emit(CoreEvent::Queue(QueueEvent::ConflictResolved {
            change_id: change_id.value(),
            use_remote,
            requeued_change_id: requeued.map(|id| id.value()),
        }));

        Ok(requeued)
    }

    /// Give a failed entry a fresh retry budget and drain.
    #[instrument(skip(self), fields(change_id = %change_id))]
    pub async fn retry_failed(&self, change_id: ChangeId) -> Result<DrainOutcome> {
        self.queue.retry_failed(change_id).await?;

        self.emit(CoreEvent::Queue(QueueEvent::FailedRetried {
            change_id: change_id.value(),
        }));

        self.sync_now().await
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or_else(|e| *e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::SeqCst)
    }

    /// Completion time of the last drain that finished without failures
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
            .read()
            .map(|time| *time)
            .unwrap_or_else(|e| *e.into_inner())
    }

    pub fn session(&self) -> Option<SyncSession> {
        self.session
            .read()
            .map(|session| session.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Register a callback for every subsequent event. Past events are not
    /// replayed. Call [`ListenerHandle::unsubscribe`] to stop it.
    pub fn add_event_listener<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(CoreEvent) + Send + Sync + 'static,
    {
        self.event_bus.add_listener(handler)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn queue(&self) -> &Arc<PendingChangesRepository> {
        &self.queue
    }

    pub async fn get_pending(&self) -> Result<Vec<PendingChange>> {
        self.queue.get_pending().await
    }

    pub async fn get_conflicts(&self) -> Result<Vec<PendingChange>> {
        self.queue.get_conflicts().await
    }

    pub async fn get_failed(&self) -> Result<Vec<PendingChange>> {
        self.queue.get_failed().await
    }

    pub async fn get_pending_count(&self) -> Result<u64> {
        self.queue.get_pending_count().await
    }

    pub async fn get_conflict_count(&self) -> Result<u64> {
        self.queue.get_conflict_count().await
    }

    pub async fn get_failed_count(&self) -> Result<u64> {
        self.queue.get_failed_count().await
    }

    // ------------------------------------------------------------------
    // Drain internals
    // ------------------------------------------------------------------

    async fn drain_pass(&self) -> Result<DrainOutcome> {
        if !self.is_online() && !self.refresh_connectivity().await {
            self.enter_offline();
            return Ok(DrainOutcome::SkippedOffline);
        }
        self.enter_online();

        let pending = self.queue.get_pending().await?;
        let run_id = Uuid::new_v4().to_string();

        self.transition(SyncState::Syncing)?;
        self.emit(CoreEvent::Sync(SyncEvent::SyncStart {
            run_id: run_id.clone(),
            pending: pending.len() as u64,
        }));
        info!(run_id = %run_id, pending = pending.len(), "Drain started");

        let cancel = self.cancel_token();
        let mut report = DrainReport::new(run_id);

        for change in pending {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match self.push_change(&change, &report.run_id).await {
                Ok(EntryOutcome::Synced) => report.synced += 1,
                Ok(EntryOutcome::Rebased) => report.rebased += 1,
                Ok(EntryOutcome::Conflict) => report.conflicts += 1,
                Ok(EntryOutcome::Failed) => report.failed += 1,
                Ok(EntryOutcome::Skipped) => {}
                Ok(EntryOutcome::Deferred) => {
                    report.deferred = true;
                    break;
                }
                Err(e) => {
                    error!(run_id = %report.run_id, change_id = %change.id, error = %e, "Drain aborted by local store failure");
                    if self.transition(SyncState::Error).is_ok() {
                        self.emit(CoreEvent::Sync(SyncEvent::SyncError {
                            run_id: Some(report.run_id.clone()),
                            change_id: Some(change.id.value()),
                            message: e.to_string(),
                            recoverable: true,
                        }));
                    }
                    return Err(e);
                }
            }
        }

        if self.config.purge_synced {
            if let Err(e) = self.queue.purge_synced().await {
                warn!(error = %e, "Failed to purge synced changes");
            }
        }

        self.finish_drain(&report)?;
        Ok(DrainOutcome::Completed(report))
    }

    fn finish_drain(&self, report: &DrainReport) -> Result<()> {
        let online = self.is_online();

        info!(
            run_id = %report.run_id,
            synced = report.synced,
            conflicts = report.conflicts,
            failed = report.failed,
            deferred = report.deferred,
            "Drain finished"
        );

        if report.deferred && !online {
            self.transition(SyncState::Offline)?;
            self.emit(CoreEvent::Sync(SyncEvent::Offline));
            return Ok(());
        }

        if report.deferred {
            self.transition(SyncState::Error)?;
            self.emit(CoreEvent::Sync(SyncEvent::SyncError {
                run_id: Some(report.run_id.clone()),
                change_id: None,
                message: "Remote store unreachable; remaining changes deferred".to_string(),
                recoverable: true,
            }));
        } else if report.failed > 0 {
            self.transition(SyncState::Error)?;
            self.emit(CoreEvent::Sync(SyncEvent::SyncError {
                run_id: Some(report.run_id.clone()),
                change_id: None,
                message: format!("{} change(s) could not be synced", report.failed),
                recoverable: false,
            }));
        } else {
            self.transition(SyncState::Idle)?;
            if !report.interrupted {
                let timestamp = self.clock.now();
                if let Ok(mut last) = self.last_sync_time.write() {
                    *last = Some(timestamp);
                }
                self.emit(CoreEvent::Sync(SyncEvent::SyncComplete {
                    run_id: report.run_id.clone(),
                    timestamp,
                    synced: report.synced,
                    conflicts: report.conflicts,
                }));
            }
        }

        // Connectivity dropped mid-drain without stopping it
        if !online {
            self.enter_offline();
        }

        Ok(())
    }

    async fn push_change(&self, listed: &PendingChange, run_id: &str) -> Result<EntryOutcome> {
        // Re-read under the claim: the entry may have been coalesced since
        // the pending list was taken.
        let Some(change) = self.queue.mark_syncing(listed.id).await? else {
            return Ok(EntryOutcome::Skipped);
        };

        let key = change.key();
        let expected_version = match change.operation {
            Operation::Create => Some(1),
            _ => change.base_version.map(|base| base + 1),
        };
        if let Some(version) = expected_version {
            self.remember_own_write(&key, version);
        }

        debug!(
            run_id = %run_id,
            change_id = %change.id,
            key = %key,
            operation = %change.operation,
            base_version = ?change.base_version,
            "Pushing change"
        );

        let result = match change.operation {
            Operation::Create => {
                self.remote_call(
                    self.remote
                        .write_if_version_matches(&key, None, &change.payload),
                )
                .await
            }
            Operation::Update => {
                self.remote_call(self.remote.write_if_version_matches(
                    &key,
                    change.base_version,
                    &change.payload,
                ))
                .await
            }
            Operation::Delete => {
                self.remote_call(
                    self.remote
                        .delete_if_version_matches(&key, change.base_version),
                )
                .await
            }
        };

        match result {
            Ok(WriteOutcome::Applied { new_version }) => {
                if Some(new_version) != expected_version {
                    self.remember_own_write(&key, new_version);
                }

                match self
                    .queue
                    .mark_applied(change.id, change.revision, new_version)
                    .await?
                {
                    ApplyOutcome::Synced => Ok(EntryOutcome::Synced),
                    ApplyOutcome::Rebased => {
                        self.rerun.store(true, Ordering::SeqCst);
                        Ok(EntryOutcome::Rebased)
                    }
                    ApplyOutcome::Ignored => Ok(EntryOutcome::Skipped),
                }
            }
            Ok(WriteOutcome::VersionMismatch { current }) => {
                self.forget_own_write(&key, expected_version);
                self.handle_mismatch(&change, current.as_ref(), run_id).await
            }
            Err(e) if e.is_transient() => {
                self.forget_own_write(&key, expected_version);
                self.handle_transient(&change, &e, run_id).await
            }
            Err(e) => {
                self.forget_own_write(&key, expected_version);
                warn!(run_id = %run_id, change_id = %change.id, error = %e, "Change rejected by remote store");
                self.fail_entry(&change, e.to_string(), run_id).await
            }
        }
    }

    async fn handle_mismatch(
        &self,
        change: &PendingChange,
        current: Option<&bridge_traits::RemoteRecord>,
        run_id: &str,
    ) -> Result<EntryOutcome> {
        match self.resolver.evaluate(change, current) {
            Resolution::AlreadyApplied => {
                debug!(change_id = %change.id, "Remote store already reflects the change");
                self.queue.mark_synced(change.id).await?;
                Ok(EntryOutcome::Synced)
            }
            Resolution::Apply => {
                // The store refused a write the versions say should have
                // landed; something raced us. Try again next cycle.
                let err = SyncError::InvalidOperation(
                    "remote store refused a write at the matching version".to_string(),
                );
                self.handle_transient(change, &err, run_id).await
            }
            Resolution::Conflict { details, kind } => {
                warn!(
                    run_id = %run_id,
                    change_id = %change.id,
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    kind = kind.as_str(),
                    local_version = ?details.local_version,
                    remote_version = details.remote_version,
                    "Conflict detected; awaiting manual resolution"
                );

                let local_version = details.local_version;
                let remote_version = details.remote_version;
                if !self.queue.mark_conflict(change.id, details).await? {
                    return Ok(EntryOutcome::Skipped);
                }

                self.emit(CoreEvent::Sync(SyncEvent::ConflictDetected {
                    change_id: change.id.value(),
                    entity_type: change.entity_type.clone(),
                    entity_id: change.entity_id.clone(),
                    local_version,
                    remote_version,
                }));
                Ok(EntryOutcome::Conflict)
            }
        }
    }

    async fn handle_transient(
        &self,
        change: &PendingChange,
        err: &SyncError,
        run_id: &str,
    ) -> Result<EntryOutcome> {
        let Some(attempts) = self
            .queue
            .record_attempt_failure(change.id, err.to_string())
            .await?
        else {
            return Ok(EntryOutcome::Skipped);
        };

        if attempts >= self.config.max_attempts {
            warn!(
                run_id = %run_id,
                change_id = %change.id,
                attempts,
                error = %err,
                "Retry budget exhausted"
            );
            return self
                .fail_entry(
                    change,
                    format!("gave up after {} attempts: {}", attempts, err),
                    run_id,
                )
                .await;
        }

        warn!(
            run_id = %run_id,
            change_id = %change.id,
            attempts,
            max_attempts = self.config.max_attempts,
            error = %err,
            "Transient failure; deferring remaining changes"
        );
        Ok(EntryOutcome::Deferred)
    }

    async fn fail_entry(
        &self,
        change: &PendingChange,
        message: String,
        run_id: &str,
    ) -> Result<EntryOutcome> {
        if !self.queue.mark_failed(change.id, message.clone()).await? {
            return Ok(EntryOutcome::Skipped);
        }

        self.emit(CoreEvent::Sync(SyncEvent::SyncError {
            run_id: Some(run_id.to_string()),
            change_id: Some(change.id.value()),
            message,
            recoverable: false,
        }));
        Ok(EntryOutcome::Failed)
    }

    async fn remote_call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = bridge_traits::error::Result<T>>,
    {
        let limit = self.config.operation_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(limit.as_millis() as u64)),
        }
    }

    // ------------------------------------------------------------------
    // Connectivity and remote feed
    // ------------------------------------------------------------------

    /// Probe the monitor and record the result.
    async fn refresh_connectivity(&self) -> bool {
        let online = match tokio::time::timeout(
            self.config.operation_timeout,
            self.network.get_network_info(),
        )
        .await
        {
            Ok(Ok(info)) => info.is_online(),
            Ok(Err(e)) => {
                warn!(error = %e, "Connectivity probe failed");
                false
            }
            Err(_) => {
                warn!("Connectivity probe timed out");
                false
            }
        };

        self.is_online.store(online, Ordering::SeqCst);
        online
    }

    fn handle_connectivity(&self, online: bool) {
        let was_online = self.is_online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!(online, "Connectivity changed");
        }

        if online {
            if self.enter_online() {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.sync_now().await {
                        warn!(error = %e, "Drain after reconnect failed");
                    }
                });
            }
        } else {
            self.enter_offline();
        }
    }

    /// `offline → idle`, emitting `online`. Returns whether it moved.
    fn enter_online(&self) -> bool {
        if self.state() != SyncState::Offline {
            return false;
        }
        match self.transition(SyncState::Idle) {
            Ok(true) => {
                self.emit(CoreEvent::Sync(SyncEvent::Online));
                true
            }
            _ => false,
        }
    }

    /// `idle`/`error → offline`, emitting `offline`. A running drain is left
    /// alone; it lands in `offline` when it finishes.
    fn enter_offline(&self) {
        if !matches!(self.state(), SyncState::Idle | SyncState::Error) {
            return;
        }
        if let Ok(true) = self.transition(SyncState::Offline) {
            self.emit(CoreEvent::Sync(SyncEvent::Offline));
        }
    }

    fn handle_remote_change(&self, change: RemoteChange) {
        let Some(session) = self.session() else {
            return;
        };
        if change.key.household_id != session.household_id {
            return;
        }

        let own = self
            .own_writes
            .lock()
            .map(|mut cache| cache.pop(&(change.key.clone(), change.version)).is_some())
            .unwrap_or(false);
        if own {
            return;
        }

        debug!(key = %change.key, version = change.version, "Remote record changed by another writer");
        self.emit(CoreEvent::Sync(SyncEvent::RemoteUpdate {
            household_id: change.key.household_id,
            entity_type: change.key.entity_type,
            entity_id: change.key.entity_id,
            version: change.version,
            deleted: change.deleted,
        }));
    }

    fn remember_own_write(&self, key: &bridge_traits::RecordKey, version: u64) {
        if let Ok(mut cache) = self.own_writes.lock() {
            cache.put((key.clone(), version), ());
        }
    }

    fn forget_own_write(&self, key: &bridge_traits::RecordKey, version: Option<u64>) {
        if let (Some(version), Ok(mut cache)) = (version, self.own_writes.lock()) {
            cache.pop(&(key.clone(), version));
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Move to `to`, emitting `state_changed`. Returns whether the state
    /// changed.
    fn transition(&self, to: SyncState) -> Result<bool> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == to {
                return Ok(false);
            }
            state.validate_transition(to)?;
            let from = *state;
            *state = to;
            from
        };

        debug!(from = %from, to = %to, "Sync state changed");
        self.emit(CoreEvent::Sync(SyncEvent::StateChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }));
        Ok(true)
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is not an error
        self.event_bus.emit(event).ok();
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<SyncSession>> {
        self.session.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("is_online", &self.is_online())
            .field("session", &self.session())
            .finish()
    }
}
