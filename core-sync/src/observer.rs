//! Cached sync status for UI layers.
//!
//! [`SyncStatusObserver`] keeps a [`SyncStatus`] snapshot current by
//! refreshing it after every engine event that follows a queue or state
//! mutation. Callers read the snapshot synchronously or await changes through
//! [`SyncStatusObserver::watch`]. If events were missed (lagging subscriber)
//! the snapshot is simply refreshed; [`SyncStatusObserver::refresh`] is the
//! polling fallback.

use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventStream, RecvError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::change::{ChangeId, PendingChange};
use crate::engine::{DrainOutcome, SyncEngine};
use crate::error::Result;
use crate::state::SyncState;

/// Snapshot of everything a status indicator renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_count: u64,
    pub conflict_count: u64,
    pub failed_count: u64,
}

impl SyncStatus {
    /// Anything the user still has to act on or wait for
    pub fn has_outstanding_work(&self) -> bool {
        self.pending_count > 0 || self.conflict_count > 0 || self.failed_count > 0
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            is_online: false,
            last_sync_time: None,
            pending_count: 0,
            conflict_count: 0,
            failed_count: 0,
        }
    }
}

/// Event-driven status cache over a [`SyncEngine`].
///
/// The background refresh task stops when the observer is dropped.
pub struct SyncStatusObserver {
    engine: SyncEngine,
    status: Arc<watch::Sender<SyncStatus>>,
    task: JoinHandle<()>,
}

impl SyncStatusObserver {
    /// Take an initial snapshot and start following the engine's events.
    pub async fn attach(engine: SyncEngine) -> Result<Self> {
        // Subscribe before the first snapshot so nothing slips in between
        let events = EventStream::new(engine.subscribe()).filter(CoreEvent::invalidates_status);

        let initial = snapshot(&engine).await?;
        let (sender, _) = watch::channel(initial);
        let status = Arc::new(sender);

        let task = tokio::spawn(follow(engine.clone(), events, status.clone()));

        Ok(Self {
            engine,
            status,
            task,
        })
    }

    /// Latest cached snapshot
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every snapshot change
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Re-read everything from the engine now.
    pub async fn refresh(&self) -> Result<SyncStatus> {
        let fresh = snapshot(&self.engine).await?;
        self.status.send_replace(fresh.clone());
        Ok(fresh)
    }

    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.engine.sync_now().await
    }

    pub async fn resolve_conflict_with_local(&self, id: ChangeId) -> Result<Option<ChangeId>> {
        self.engine.resolve_conflict_manually(id, false).await
    }

    pub async fn resolve_conflict_with_remote(&self, id: ChangeId) -> Result<()> {
        self.engine.resolve_conflict_manually(id, true).await?;
        Ok(())
    }

    pub async fn retry_failed(&self, id: ChangeId) -> Result<DrainOutcome> {
        self.engine.retry_failed(id).await
    }

    pub async fn pending(&self) -> Result<Vec<PendingChange>> {
        self.engine.get_pending().await
    }

    pub async fn conflicts(&self) -> Result<Vec<PendingChange>> {
        self.engine.get_conflicts().await
    }

    pub async fn failed(&self) -> Result<Vec<PendingChange>> {
        self.engine.get_failed().await
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }
}

impl Drop for SyncStatusObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn snapshot(engine: &SyncEngine) -> Result<SyncStatus> {
    Ok(SyncStatus {
        state: engine.state(),
        is_online: engine.is_online(),
        last_sync_time: engine.last_sync_time(),
        pending_count: engine.get_pending_count().await?,
        conflict_count: engine.get_conflict_count().await?,
        failed_count: engine.get_failed_count().await?,
    })
}

async fn follow(
    engine: SyncEngine,
    mut events: EventStream,
    status: Arc<watch::Sender<SyncStatus>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(event = event.description(), "Refreshing sync status"),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Status observer lagged; refreshing")
            }
            Err(RecvError::Closed) => break,
        }

        match snapshot(&engine).await {
            Ok(fresh) => {
                status.send_if_modified(|current| {
                    if *current == fresh {
                        return false;
                    }
                    *current = fresh;
                    true
                });
            }
            Err(e) => warn!(error = %e, "Failed to refresh sync status"),
        }
    }
}
