//! # Local Change Queue
//!
//! Durable record of local mutations the remote store has not yet confirmed.
//! Rows are appended first and only leave the queue once the remote store
//! acknowledged them (or the user discarded them), so a crash never drops an
//! edit silently.
//!
//! ## Coalescing
//!
//! At most one outstanding (`pending`/`syncing`/`conflict`) entry exists per
//! `(entity_type, entity_id)`. A new mutation for an entity that already has
//! one is merged into it (see [`PendingChange::coalesce_with`]):
//!
//! - a `pending` entry simply takes the merged operation and payload
//! - a `pending` create followed by a delete never reached the server, so the
//!   entry is dropped outright
//! - a `syncing` entry gets its `revision` bumped; when the in-flight write is
//!   confirmed with the older revision the entry is rebased onto the new
//!   remote version and returned to `pending` (see [`ApplyOutcome::Rebased`])
//! - a `conflict` entry keeps its status and its conflict details are updated
//!   with the newer local payload
//!
//! ## Idempotence
//!
//! `mark_*` operations on an entry that is missing or already terminal are
//! no-ops and report `false`/`None`.

use bridge_traits::{Clock, SystemClock};
use core_runtime::logging::summarize_payload;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::change::{
    ChangeId, ChangeStatus, ConflictDetails, NewChange, Operation, PendingChange,
};
use crate::error::{Result, SyncError};
use crate::store::{PendingChangeStore, SqlitePendingChangeStore};

/// Statuses returned by [`PendingChangesRepository::get_pending`]
const PENDING_STATUSES: &[ChangeStatus] = &[ChangeStatus::Pending, ChangeStatus::Syncing];

/// Result of [`PendingChangesRepository::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// Entry holding the mutation
    pub id: ChangeId,
    /// Operation the entry now carries
    pub operation: Operation,
    /// Merged into an existing outstanding entry
    pub coalesced: bool,
}

/// Result of confirming an in-flight write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry is now `synced`
    Synced,
    /// A newer local edit arrived mid-flight; the entry is `pending` again,
    /// based on the version just written
    Rebased,
    /// Entry was missing or already terminal
    Ignored,
}

/// Local change queue
pub struct PendingChangesRepository {
    store: Arc<dyn PendingChangeStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl PendingChangesRepository {
    /// Open the queue backed by SQLite, creating its table if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = SqlitePendingChangeStore::new(pool);
        store.initialize().await?;

        Ok(Self::with_store(Arc::new(store), Arc::new(SystemClock)))
    }

    /// Create a queue over a custom store and clock
    pub fn with_store(store: Arc<dyn PendingChangeStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    fn now(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    /// Queue a local mutation, coalescing it into any outstanding entry for
    /// the same entity.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidOperation`] if the mutation is malformed
    /// - [`SyncError::InvalidSequence`] if it cannot follow the outstanding
    ///   entry (anything after a delete, a create after a create or update)
    pub async fn enqueue(&self, change: NewChange) -> Result<EnqueueResult> {
        change.validate()?;

        let _guard = self.write_lock.lock().await;
        let now = self.now();

        let Some(mut existing) = self
            .store
            .find_outstanding(&change.entity_type, &change.entity_id)
            .await?
        else {
            let id = self.store.insert(&change, now).await?;
            info!(
                change_id = %id,
                entity_type = %change.entity_type,
                entity_id = %change.entity_id,
                operation = %change.operation,
                payload = %summarize_payload(&change.payload),
                "Queued local change"
            );
            return Ok(EnqueueResult {
                id,
                operation: change.operation,
                coalesced: false,
            });
        };

        let merged = existing.coalesce_with(&change)?;

        if existing.status == ChangeStatus::Pending
            && existing.operation == Operation::Create
            && merged.operation == Operation::Delete
        {
            self.store.delete(existing.id).await?;
            info!(
                change_id = %existing.id,
                entity_type = %existing.entity_type,
                entity_id = %existing.entity_id,
                "Create cancelled by delete before reaching the remote store; entry dropped"
            );
            return Ok(EnqueueResult {
                id: existing.id,
                operation: Operation::Delete,
                coalesced: true,
            });
        }

        existing.operation = merged.operation;
        existing.payload = merged.payload;
        existing.base_version = merged.base_version;
        existing.updated_at = now;

        match existing.status {
            ChangeStatus::Syncing => {
                existing.revision += 1;
            }
            ChangeStatus::Conflict => {
                if let Some(conflict) = existing.conflict.as_mut() {
                    conflict.local_payload = existing.payload.clone();
                }
            }
            _ => {}
        }

        self.store.update(&existing).await?;

        debug!(
            change_id = %existing.id,
            entity_type = %existing.entity_type,
            entity_id = %existing.entity_id,
            operation = %existing.operation,
            status = %existing.status,
            revision = existing.revision,
            "Coalesced local change into outstanding entry"
        );

        Ok(EnqueueResult {
            id: existing.id,
            operation: existing.operation,
            coalesced: true,
        })
    }

    /// Entries awaiting push (`pending`, plus any in flight), oldest first
    pub async fn get_pending(&self) -> Result<Vec<PendingChange>> {
        self.store.list_by_statuses(PENDING_STATUSES).await
    }

    /// Entries awaiting manual resolution, oldest first
    pub async fn get_conflicts(&self) -> Result<Vec<PendingChange>> {
        self.store.list_by_statuses(&[ChangeStatus::Conflict]).await
    }

    /// Entries that exhausted their retries or were rejected, oldest first
    pub async fn get_failed(&self) -> Result<Vec<PendingChange>> {
        self.store.list_by_statuses(&[ChangeStatus::Failed]).await
    }

    pub async fn get_pending_count(&self) -> Result<u64> {
        self.store.count_by_statuses(PENDING_STATUSES).await
    }

    pub async fn get_conflict_count(&self) -> Result<u64> {
        self.store.count_by_statuses(&[ChangeStatus::Conflict]).await
    }

    pub async fn get_failed_count(&self) -> Result<u64> {
        self.store.count_by_statuses(&[ChangeStatus::Failed]).await
    }

    pub async fn get(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        self.store.find_by_id(id).await
    }

    /// Claim an entry for a remote write. Returns the claimed entry (its
    /// `revision` identifies the snapshot being pushed), or `None` if the
    /// entry is gone or no longer pending.
    pub async fn mark_syncing(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut change) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };
        if !matches!(change.status, ChangeStatus::Pending | ChangeStatus::Syncing) {
            return Ok(None);
        }

        change.status = ChangeStatus::Syncing;
        change.updated_at = self.now();
        self.store.update(&change).await?;

        Ok(Some(change))
    }

    /// Mark an entry confirmed by the remote store.
    pub async fn mark_synced(&self, id: ChangeId) -> Result<bool> {
        self.transition(id, |change| {
            change.status = ChangeStatus::Synced;
            change.last_error = None;
        })
        .await
    }

    /// Confirm the write of `revision`, which produced `new_version`.
    ///
    /// If the entry was edited while the write was in flight it is rebased
    /// onto `new_version` and returned to `pending` instead of `synced`.
    pub async fn mark_applied(
        &self,
        id: ChangeId,
        revision: u32,
        new_version: u64,
    ) -> Result<ApplyOutcome> {
        let _guard = self.write_lock.lock().await;

        let Some(mut change) = self.store.find_by_id(id).await? else {
            return Ok(ApplyOutcome::Ignored);
        };
        if change.status.is_terminal() {
            return Ok(ApplyOutcome::Ignored);
        }

        change.updated_at = self.now();
        change.last_error = None;

        let outcome = if change.revision == revision {
            change.status = ChangeStatus::Synced;
            ApplyOutcome::Synced
        } else {
            if change.operation == Operation::Create {
                change.operation = Operation::Update;
            }
            change.base_version = Some(new_version);
            change.status = ChangeStatus::Pending;
            change.attempt_count = 0;

            debug!(
                change_id = %id,
                base_version = new_version,
                "Entry edited during push; rebased onto the version just written"
            );
            ApplyOutcome::Rebased
        };

        self.store.update(&change).await?;
        Ok(outcome)
    }

    /// Move an entry to `conflict`. The stored local side always reflects the
    /// entry's latest payload and base version.
    pub async fn mark_conflict(&self, id: ChangeId, details: ConflictDetails) -> Result<bool> {
        self.transition(id, move |change| {
            change.status = ChangeStatus::Conflict;
            change.conflict = Some(ConflictDetails {
                local_version: change.base_version,
                local_payload: change.payload.clone(),
                ..details
            });
        })
        .await
    }

    pub async fn mark_failed(&self, id: ChangeId, error: impl Into<String>) -> Result<bool> {
        let error = error.into();
        self.transition(id, move |change| {
            change.status = ChangeStatus::Failed;
            change.last_error = Some(error);
        })
        .await
    }

    /// Count a failed push attempt and leave the entry `pending`.
    ///
    /// Returns the new attempt count, or `None` if the entry is missing or
    /// terminal.
    pub async fn record_attempt_failure(
        &self,
        id: ChangeId,
        error: impl Into<String>,
    ) -> Result<Option<u32>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut change) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };
        if change.status.is_terminal() {
            return Ok(None);
        }

        change.attempt_count += 1;
        change.last_error = Some(error.into());
        change.status = ChangeStatus::Pending;
        change.updated_at = self.now();
        self.store.update(&change).await?;

        Ok(Some(change.attempt_count))
    }

    /// Delete an entry regardless of status.
    pub async fn remove(&self, id: ChangeId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(id).await
    }

    /// Return a `failed` entry to `pending` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ChangeNotFound`] if the entry does not exist
    /// - [`SyncError::InvalidStatus`] if it is not `failed`
    /// - [`SyncError::InvalidSequence`] if a newer mutation for the same
    ///   entity is already outstanding
    pub async fn retry_failed(&self, id: ChangeId) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut change = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(SyncError::ChangeNotFound(id.value()))?;

        if change.status != ChangeStatus::Failed {
            return Err(SyncError::InvalidStatus(format!(
                "change {} is {}, only failed changes can be retried",
                id, change.status
            )));
        }

        if self
            .store
            .find_outstanding(&change.entity_type, &change.entity_id)
            .await?
            .is_some()
        {
            return Err(SyncError::InvalidSequence {
                entity_type: change.entity_type,
                entity_id: change.entity_id,
                reason: "a newer change for this entity is already queued".to_string(),
            });
        }

        change.status = ChangeStatus::Pending;
        change.attempt_count = 0;
        change.last_error = None;
        change.updated_at = self.now();
        self.store.update(&change).await?;

        info!(change_id = %id, "Failed change returned to the queue");
        Ok(())
    }

    /// Delete confirmed rows; returns how many were removed.
    pub async fn purge_synced(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let purged = self.store.delete_by_status(ChangeStatus::Synced).await?;
        if purged > 0 {
            debug!(purged, "Purged synced changes");
        }
        Ok(purged)
    }

    /// Return entries left `syncing` by an interrupted process to `pending`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let recovered = self
            .store
            .reset_status(ChangeStatus::Syncing, ChangeStatus::Pending, self.now())
            .await?;
        if recovered > 0 {
            warn!(recovered, "Recovered changes interrupted mid-push");
        }
        Ok(recovered)
    }

    /// Settle a conflict.
    ///
    /// With `use_remote` the local edit is discarded. Otherwise the local
    /// payload is queued again on top of `current_remote_version` (the
    /// server's version at resolution time, `None` if the record no longer
    /// exists) and the conflict entry is replaced. Returns the id of the new
    /// entry, if one was queued.
    pub async fn resolve_conflict(
        &self,
        id: ChangeId,
        use_remote: bool,
        current_remote_version: Option<u64>,
    ) -> Result<Option<ChangeId>> {
        let _guard = self.write_lock.lock().await;

        let change = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(SyncError::ChangeNotFound(id.value()))?;

        if change.status != ChangeStatus::Conflict {
            return Err(SyncError::InvalidStatus(format!(
                "change {} is {}, not conflict",
                id, change.status
            )));
        }

        if use_remote {
            self.store.delete(id).await?;
            info!(change_id = %id, "Conflict resolved with remote value; local edit discarded");
            return Ok(None);
        }

        let requeued = match (change.operation, current_remote_version) {
            (Operation::Delete, None) => None,
            (Operation::Delete, Some(version)) => Some((Operation::Delete, Some(version))),
            (_, None) => Some((Operation::Create, None)),
            (_, Some(version)) => Some((Operation::Update, Some(version))),
        };

        let Some((operation, base_version)) = requeued else {
            self.store.delete(id).await?;
            info!(change_id = %id, "Conflict resolved: record already gone remotely");
            return Ok(None);
        };

        let payload = if operation == Operation::Delete {
            Value::Null
        } else {
            change.payload.clone()
        };

        let new_change = NewChange {
            household_id: change.household_id,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            operation,
            payload,
            base_version,
        };
        let new_id = self.store.replace(id, &new_change, self.now()).await?;

        info!(
            change_id = %id,
            requeued_change_id = %new_id,
            operation = %operation,
            base_version = ?base_version,
            "Conflict resolved with local value; change re-queued"
        );

        Ok(Some(new_id))
    }

    /// Apply `apply` to a non-terminal entry under the write lock.
    async fn transition<F>(&self, id: ChangeId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut PendingChange) + Send,
    {
        let _guard = self.write_lock.lock().await;

        let Some(mut change) = self.store.find_by_id(id).await? else {
            return Ok(false);
        };
        if change.status.is_terminal() {
            return Ok(false);
        }

        apply(&mut change);
        change.updated_at = self.now();
        self.store.update(&change).await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use bridge_traits::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn repository() -> PendingChangesRepository {
        let pool = create_test_pool().await.unwrap();
        PendingChangesRepository::new(pool).await.unwrap()
    }

    fn details(remote_version: u64) -> ConflictDetails {
        ConflictDetails {
            local_version: None,
            remote_version,
            local_payload: Value::Null,
            remote_payload: Some(json!({ "name": "Truck" })),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_get_pending() {
        let repo = repository().await;

        let first = repo
            .enqueue(NewChange::create("hh", "transaction", "T9", json!({ "amount": 12 })))
            .await
            .unwrap();
        let second = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({ "name": "Car" }), 3))
            .await
            .unwrap();

        assert!(!first.coalesced);
        let pending = repo.get_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
        assert_eq!(repo.get_pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_coalescing_keeps_one_outstanding_entry() {
        let repo = repository().await;

        repo.enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3))
            .await
            .unwrap();
        let result = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 2 }), 3))
            .await
            .unwrap();

        assert!(result.coalesced);
        let pending = repo.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!({ "v": 2 }));
        assert_eq!(pending[0].base_version, Some(3));
    }

    #[tokio::test]
    async fn test_pending_create_then_delete_drops_entry() {
        let repo = repository().await;

        repo.enqueue(NewChange::create("hh", "transaction", "T1", json!({})))
            .await
            .unwrap();
        let result = repo
            .enqueue(NewChange::delete("hh", "transaction", "T1", 1))
            .await
            .unwrap();

        assert!(result.coalesced);
        assert_eq!(result.operation, Operation::Delete);
        assert_eq!(repo.get_pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_delete_is_invalid_sequence() {
        let repo = repository().await;

        repo.enqueue(NewChange::delete("hh", "asset", "A1", 2))
            .await
            .unwrap();
        let err = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({}), 2))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidSequence { .. }));
        assert_eq!(repo.get_pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::create("hh", "asset", "A1", json!({})))
            .await
            .unwrap()
            .id;

        assert!(repo.mark_synced(id).await.unwrap());
        assert!(!repo.mark_synced(id).await.unwrap());
        assert_eq!(repo.get_pending_count().await.unwrap(), 0);
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, ChangeStatus::Synced);
    }

    #[tokio::test]
    async fn test_mark_operations_on_missing_entry_are_noops() {
        let repo = repository().await;
        let missing = ChangeId::new(404);

        assert!(!repo.mark_synced(missing).await.unwrap());
        assert!(!repo.mark_failed(missing, "boom").await.unwrap());
        assert!(!repo.mark_conflict(missing, details(2)).await.unwrap());
        assert!(repo.mark_syncing(missing).await.unwrap().is_none());
        assert!(repo
            .record_attempt_failure(missing, "boom")
            .await
            .unwrap()
            .is_none());
        assert!(!repo.remove(missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_flow_and_resolution_with_local() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({ "name": "Car" }), 3))
            .await
            .unwrap()
            .id;

        repo.mark_syncing(id).await.unwrap();
        assert!(repo.mark_conflict(id, details(4)).await.unwrap());

        let conflicts = repo.get_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        let conflict = conflicts[0].conflict.clone().unwrap();
        assert_eq!(conflict.local_version, Some(3));
        assert_eq!(conflict.remote_version, 4);
        assert_eq!(conflict.local_payload, json!({ "name": "Car" }));
        assert_eq!(repo.get_conflict_count().await.unwrap(), 1);

        // Terminal: a later failure report does not touch it
        assert!(!repo.mark_failed(id, "late").await.unwrap());

        let new_id = repo.resolve_conflict(id, false, Some(5)).await.unwrap().unwrap();
        assert!(repo.get(id).await.unwrap().is_none());

        let requeued = repo.get(new_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, ChangeStatus::Pending);
        assert_eq!(requeued.operation, Operation::Update);
        assert_eq!(requeued.base_version, Some(5));
        assert_eq!(requeued.payload, json!({ "name": "Car" }));
        assert_eq!(repo.get_conflict_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolution_with_remote_discards_entry() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({}), 3))
            .await
            .unwrap()
            .id;
        repo.mark_conflict(id, details(4)).await.unwrap();

        assert_eq!(repo.resolve_conflict(id, true, None).await.unwrap(), None);
        assert!(repo.get(id).await.unwrap().is_none());
        assert_eq!(repo.get_pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolution_requires_conflict_status() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::create("hh", "asset", "A1", json!({})))
            .await
            .unwrap()
            .id;

        assert!(matches!(
            repo.resolve_conflict(id, true, None).await,
            Err(SyncError::InvalidStatus(_))
        ));
        assert!(matches!(
            repo.resolve_conflict(ChangeId::new(99), true, None).await,
            Err(SyncError::ChangeNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_resolution_when_remote_record_vanished() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3))
            .await
            .unwrap()
            .id;
        repo.mark_conflict(id, details(0)).await.unwrap();

        let new_id = repo.resolve_conflict(id, false, None).await.unwrap().unwrap();
        let requeued = repo.get(new_id).await.unwrap().unwrap();
        assert_eq!(requeued.operation, Operation::Create);
        assert_eq!(requeued.base_version, None);
    }

    #[tokio::test]
    async fn test_edit_during_push_rebases_entry() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::create("hh", "asset", "A1", json!({ "v": 1 })))
            .await
            .unwrap()
            .id;

        let claimed = repo.mark_syncing(id).await.unwrap().unwrap();
        repo.enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 2 }), 1))
            .await
            .unwrap();

        let outcome = repo.mark_applied(id, claimed.revision, 1).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Rebased);

        let entry = repo.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ChangeStatus::Pending);
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.base_version, Some(1));
        assert_eq!(entry.payload, json!({ "v": 2 }));

        let claimed = repo.mark_syncing(id).await.unwrap().unwrap();
        assert_eq!(
            repo.mark_applied(id, claimed.revision, 2).await.unwrap(),
            ApplyOutcome::Synced
        );
        assert_eq!(
            repo.mark_applied(id, claimed.revision, 2).await.unwrap(),
            ApplyOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_attempt_failures_and_retry_failed() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({}), 1))
            .await
            .unwrap()
            .id;

        repo.mark_syncing(id).await.unwrap();
        assert_eq!(repo.record_attempt_failure(id, "timeout").await.unwrap(), Some(1));
        assert_eq!(repo.record_attempt_failure(id, "timeout").await.unwrap(), Some(2));

        let entry = repo.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ChangeStatus::Pending);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));

        assert!(repo.mark_failed(id, "gave up").await.unwrap());
        assert_eq!(repo.get_failed_count().await.unwrap(), 1);
        assert_eq!(repo.get_failed().await.unwrap()[0].id, id);

        repo.retry_failed(id).await.unwrap();
        let entry = repo.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ChangeStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert!(entry.last_error.is_none());

        assert!(matches!(
            repo.retry_failed(id).await,
            Err(SyncError::InvalidStatus(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_failed_blocked_by_newer_outstanding_change() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({}), 1))
            .await
            .unwrap()
            .id;
        repo.mark_failed(id, "rejected").await.unwrap();

        repo.enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 2 }), 1))
            .await
            .unwrap();

        assert!(matches!(
            repo.retry_failed(id).await,
            Err(SyncError::InvalidSequence { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_and_purge() {
        let repo = repository().await;
        let a = repo
            .enqueue(NewChange::create("hh", "asset", "A1", json!({})))
            .await
            .unwrap()
            .id;
        let b = repo
            .enqueue(NewChange::create("hh", "asset", "A2", json!({})))
            .await
            .unwrap()
            .id;

        repo.mark_syncing(a).await.unwrap();
        repo.mark_syncing(b).await.unwrap();
        repo.mark_synced(b).await.unwrap();

        assert_eq!(repo.recover_interrupted().await.unwrap(), 1);
        assert_eq!(repo.get(a).await.unwrap().unwrap().status, ChangeStatus::Pending);

        assert_eq!(repo.purge_synced().await.unwrap(), 1);
        assert!(repo.get(b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_coalescing_into_conflict_updates_local_side() {
        let repo = repository().await;
        let id = repo
            .enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3))
            .await
            .unwrap()
            .id;
        repo.mark_conflict(id, details(4)).await.unwrap();

        repo.enqueue(NewChange::update("hh", "asset", "A1", json!({ "v": 2 }), 3))
            .await
            .unwrap();

        let entry = repo.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ChangeStatus::Conflict);
        assert_eq!(entry.conflict.unwrap().local_payload, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn test_timestamps_come_from_clock() {
        let pool = create_test_pool().await.unwrap();
        let store = SqlitePendingChangeStore::new(pool);
        store.initialize().await.unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let repo = PendingChangesRepository::with_store(Arc::new(store), clock.clone());

        let id = repo
            .enqueue(NewChange::create("hh", "asset", "A1", json!({})))
            .await
            .unwrap()
            .id;
        clock.advance(chrono::Duration::seconds(5));
        repo.mark_synced(id).await.unwrap();

        let entry = repo.get(id).await.unwrap().unwrap();
        assert_eq!(entry.created_at, start.timestamp_millis());
        assert_eq!(entry.updated_at, start.timestamp_millis() + 5_000);
    }

    mod coalescing_properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Create,
            Update(u64),
            Delete(u64),
            Claim,
            Applied(u64),
            Conflict(u64),
            Synced,
            Fail,
            Retry,
            ResolveLocal(Option<u64>),
            ResolveRemote,
        }

        fn arb_step() -> impl Strategy<Value = Step> {
            prop_oneof![
                Just(Step::Create),
                (1u64..6).prop_map(Step::Update),
                (1u64..6).prop_map(Step::Delete),
                Just(Step::Claim),
                (1u64..6).prop_map(Step::Applied),
                (1u64..6).prop_map(Step::Conflict),
                Just(Step::Synced),
                Just(Step::Fail),
                Just(Step::Retry),
                proptest::option::of(1u64..6).prop_map(Step::ResolveLocal),
                Just(Step::ResolveRemote),
            ]
        }

        async fn outstanding_rows(repo: &PendingChangesRepository) -> Vec<PendingChange> {
            repo.store
                .list_by_statuses(&[
                    ChangeStatus::Pending,
                    ChangeStatus::Syncing,
                    ChangeStatus::Conflict,
                ])
                .await
                .unwrap()
                .into_iter()
                .filter(|c| c.entity_type == "asset" && c.entity_id == "A1")
                .collect()
        }

        async fn current(repo: &PendingChangesRepository) -> Option<PendingChange> {
            repo.store.find_outstanding("asset", "A1").await.unwrap()
        }

        fn assert_enqueue_outcome(result: Result<EnqueueResult>) {
            match result {
                Ok(_) | Err(SyncError::InvalidSequence { .. }) => {}
                Err(other) => panic!("enqueue failed with {:?}", other),
            }
        }

        async fn run(steps: Vec<Step>) {
            let repo = repository().await;
            let mut claimed: Option<(ChangeId, u32)> = None;
            let mut failed: Vec<ChangeId> = Vec::new();

            for step in steps {
                match step {
                    Step::Create => assert_enqueue_outcome(
                        repo.enqueue(NewChange::create("hh", "asset", "A1", json!({ "n": 0 })))
                            .await,
                    ),
                    Step::Update(base) => assert_enqueue_outcome(
                        repo.enqueue(NewChange::update(
                            "hh",
                            "asset",
                            "A1",
                            json!({ "n": base }),
                            base,
                        ))
                        .await,
                    ),
                    Step::Delete(base) => assert_enqueue_outcome(
                        repo.enqueue(NewChange::delete("hh", "asset", "A1", base)).await,
                    ),
                    Step::Claim => {
                        if let Some(entry) = current(&repo).await {
                            if let Some(claim) = repo.mark_syncing(entry.id).await.unwrap() {
                                claimed = Some((claim.id, claim.revision));
                            }
                        }
                    }
                    Step::Applied(version) => {
                        if let Some((id, revision)) = claimed.take() {
                            repo.mark_applied(id, revision, version).await.unwrap();
                        }
                    }
                    Step::Conflict(version) => {
                        if let Some(entry) = current(&repo).await {
                            repo.mark_conflict(entry.id, details(version)).await.unwrap();
                        }
                    }
                    Step::Synced => {
                        if let Some(entry) = current(&repo).await {
                            repo.mark_synced(entry.id).await.unwrap();
                        }
                    }
                    Step::Fail => {
                        if let Some(entry) = current(&repo).await {
                            if repo.mark_failed(entry.id, "rejected").await.unwrap() {
                                failed.push(entry.id);
                            }
                        }
                    }
                    Step::Retry => {
                        if let Some(id) = failed.pop() {
                            match repo.retry_failed(id).await {
                                Ok(()) | Err(SyncError::InvalidSequence { .. }) => {}
                                Err(other) => panic!("retry failed with {:?}", other),
                            }
                        }
                    }
                    Step::ResolveLocal(version) => {
                        if let Some(entry) = current(&repo).await {
                            if entry.status == ChangeStatus::Conflict {
                                repo.resolve_conflict(entry.id, false, version).await.unwrap();
                            }
                        }
                    }
                    Step::ResolveRemote => {
                        if let Some(entry) = current(&repo).await {
                            if entry.status == ChangeStatus::Conflict {
                                repo.resolve_conflict(entry.id, true, None).await.unwrap();
                            }
                        }
                    }
                }

                assert!(outstanding_rows(&repo).await.len() <= 1);
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_at_most_one_outstanding_entry_per_entity(
                steps in prop::collection::vec(arb_step(), 1..24)
            ) {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap()
                    .block_on(run(steps));
            }
        }
    }
}
