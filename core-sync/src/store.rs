//! # Pending Change Persistence
//!
//! Row-level storage for the local change queue. The store knows nothing
//! about coalescing or status rules; [`crate::repository::PendingChangesRepository`]
//! layers those on top.
//!
//! The `pending_changes` table carries a partial unique index on
//! `(entity_type, entity_id)` over outstanding statuses, so the
//! one-outstanding-entry-per-entity invariant holds even if a caller bypasses
//! the repository.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::change::{ChangeId, ChangeStatus, ConflictDetails, NewChange, PendingChange};
use crate::error::{Result, SyncError};

/// Storage abstraction for queue rows
#[async_trait]
pub trait PendingChangeStore: Send + Sync {
    /// Insert a fresh `pending` row and return its id
    async fn insert(&self, change: &NewChange, now: i64) -> Result<ChangeId>;

    /// Overwrite every mutable column of an existing row
    async fn update(&self, change: &PendingChange) -> Result<()>;

    async fn find_by_id(&self, id: ChangeId) -> Result<Option<PendingChange>>;

    /// The outstanding (`pending`/`syncing`/`conflict`) row for an entity
    async fn find_outstanding(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<PendingChange>>;

    /// Rows in any of `statuses`, oldest first
    async fn list_by_statuses(&self, statuses: &[ChangeStatus]) -> Result<Vec<PendingChange>>;

    async fn count_by_statuses(&self, statuses: &[ChangeStatus]) -> Result<u64>;

    /// Returns whether a row was removed
    async fn delete(&self, id: ChangeId) -> Result<bool>;

    async fn delete_by_status(&self, status: ChangeStatus) -> Result<u64>;

    /// Move every row in `from` to `to`; returns the number of rows moved
    async fn reset_status(&self, from: ChangeStatus, to: ChangeStatus, now: i64) -> Result<u64>;

    /// Atomically delete `old` and insert `new` in its place
    async fn replace(&self, old: ChangeId, new: &NewChange, now: i64) -> Result<ChangeId>;
}

/// SQLite implementation of [`PendingChangeStore`]
pub struct SqlitePendingChangeStore {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, household_id, entity_type, entity_id, operation, payload,
           base_version, status, created_at, updated_at, attempt_count,
           last_error, revision, conflict
    FROM pending_changes
"#;

impl SqlitePendingChangeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the queue table and indexes if they don't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                household_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                base_version INTEGER,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                conflict TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_changes_outstanding
            ON pending_changes(entity_type, entity_id)
            WHERE status IN ('pending', 'syncing', 'conflict')
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_changes_status
            ON pending_changes(status, id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_change(row: &SqliteRow) -> Result<PendingChange> {
        let payload: String = row.get("payload");
        let conflict: Option<String> = row.get("conflict");

        Ok(PendingChange {
            id: ChangeId::new(row.get("id")),
            household_id: row.get("household_id"),
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            operation: row.get::<String, _>("operation").parse()?,
            payload: serde_json::from_str::<Value>(&payload)
                .map_err(|e| SyncError::Serialization(e.to_string()))?,
            base_version: row.get::<Option<i64>, _>("base_version").map(|v| v as u64),
            status: row.get::<String, _>("status").parse()?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            last_error: row.get("last_error"),
            revision: row.get::<i64, _>("revision") as u32,
            conflict: conflict
                .map(|c| serde_json::from_str::<ConflictDetails>(&c))
                .transpose()
                .map_err(|e| SyncError::Serialization(e.to_string()))?,
        })
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

fn to_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn conflict_to_json(conflict: &Option<ConflictDetails>) -> Result<Option<String>> {
    conflict
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

#[async_trait]
impl PendingChangeStore for SqlitePendingChangeStore {
    async fn insert(&self, change: &NewChange, now: i64) -> Result<ChangeId> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_changes (
                household_id, entity_type, entity_id, operation, payload,
                base_version, status, created_at, updated_at, attempt_count, revision
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, 0, 0)
            "#,
        )
        .bind(&change.household_id)
        .bind(&change.entity_type)
        .bind(&change.entity_id)
        .bind(change.operation.as_str())
        .bind(to_json(&change.payload)?)
        .bind(change.base_version.map(|v| v as i64))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(ChangeId::new(result.last_insert_rowid()))
    }

    async fn update(&self, change: &PendingChange) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_changes SET
                operation = ?,
                payload = ?,
                base_version = ?,
                status = ?,
                updated_at = ?,
                attempt_count = ?,
                last_error = ?,
                revision = ?,
                conflict = ?
            WHERE id = ?
            "#,
        )
        .bind(change.operation.as_str())
        .bind(to_json(&change.payload)?)
        .bind(change.base_version.map(|v| v as i64))
        .bind(change.status.as_str())
        .bind(change.updated_at)
        .bind(change.attempt_count as i64)
        .bind(&change.last_error)
        .bind(change.revision as i64)
        .bind(conflict_to_json(&change.conflict)?)
        .bind(change.id.value())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_by_id(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_change).transpose()
    }

    async fn find_outstanding(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<PendingChange>> {
        let row = sqlx::query(&format!(
            "{} WHERE entity_type = ? AND entity_id = ? \
             AND status IN ('pending', 'syncing', 'conflict') LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_change).transpose()
    }

    async fn list_by_statuses(&self, statuses: &[ChangeStatus]) -> Result<Vec<PendingChange>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "{} WHERE status IN ({}) ORDER BY id ASC",
            SELECT_COLUMNS,
            Self::placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_change).collect()
    }

    async fn count_by_statuses(&self, statuses: &[ChangeStatus]) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "SELECT COUNT(*) FROM pending_changes WHERE status IN ({})",
            Self::placeholders(statuses.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let count = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count as u64)
    }

    async fn delete(&self, id: ChangeId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_changes WHERE id = ?")
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_status(&self, status: ChangeStatus) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_changes WHERE status = ?")
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn reset_status(&self, from: ChangeStatus, to: ChangeStatus, now: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE pending_changes SET status = ?, updated_at = ? WHERE status = ?")
                .bind(to.as_str())
                .bind(now)
                .bind(from.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn replace(&self, old: ChangeId, new: &NewChange, now: i64) -> Result<ChangeId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM pending_changes WHERE id = ?")
            .bind(old.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO pending_changes (
                household_id, entity_type, entity_id, operation, payload,
                base_version, status, created_at, updated_at, attempt_count, revision
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, 0, 0)
            "#,
        )
        .bind(&new.household_id)
        .bind(&new.entity_type)
        .bind(&new.entity_id)
        .bind(new.operation.as_str())
        .bind(to_json(&new.payload)?)
        .bind(new.base_version.map(|v| v as i64))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(ChangeId::new(result.last_insert_rowid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use crate::db::create_test_pool;
    use serde_json::json;

    async fn store() -> SqlitePendingChangeStore {
        let pool = create_test_pool().await.unwrap();
        let store = SqlitePendingChangeStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = store().await;
        let id = store
            .insert(&NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3), 1_000)
            .await
            .unwrap();

        let row = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.operation, Operation::Update);
        assert_eq!(row.base_version, Some(3));
        assert_eq!(row.status, ChangeStatus::Pending);
        assert_eq!(row.payload, json!({ "v": 1 }));
        assert_eq!(row.created_at, 1_000);
        assert!(row.conflict.is_none());
    }

    #[tokio::test]
    async fn test_ids_increase_monotonically() {
        let store = store().await;
        let first = store
            .insert(&NewChange::create("hh", "transaction", "T1", json!({})), 1)
            .await
            .unwrap();
        let second = store
            .insert(&NewChange::create("hh", "transaction", "T2", json!({})), 1)
            .await
            .unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn test_unique_outstanding_index() {
        let store = store().await;
        store
            .insert(&NewChange::create("hh", "asset", "A1", json!({})), 1)
            .await
            .unwrap();

        let duplicate = store
            .insert(&NewChange::update("hh", "asset", "A1", json!({}), 1), 2)
            .await;
        assert!(matches!(duplicate, Err(SyncError::Database(_))));
    }

    #[tokio::test]
    async fn test_update_persists_conflict_details() {
        let store = store().await;
        let id = store
            .insert(&NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3), 1)
            .await
            .unwrap();

        let mut row = store.find_by_id(id).await.unwrap().unwrap();
        row.status = ChangeStatus::Conflict;
        row.conflict = Some(ConflictDetails {
            local_version: Some(3),
            remote_version: 4,
            local_payload: json!({ "v": 1 }),
            remote_payload: Some(json!({ "v": 2 })),
        });
        store.update(&row).await.unwrap();

        let reloaded = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(reloaded, row);
        assert_eq!(
            store
                .count_by_statuses(&[ChangeStatus::Conflict])
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_reset_and_delete_by_status() {
        let store = store().await;
        let id = store
            .insert(&NewChange::create("hh", "asset", "A1", json!({})), 1)
            .await
            .unwrap();

        let mut row = store.find_by_id(id).await.unwrap().unwrap();
        row.status = ChangeStatus::Syncing;
        store.update(&row).await.unwrap();

        assert_eq!(
            store
                .reset_status(ChangeStatus::Syncing, ChangeStatus::Pending, 2)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .list_by_statuses(&[ChangeStatus::Pending])
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.delete_by_status(ChangeStatus::Pending).await.unwrap(), 1);
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_swaps_rows() {
        let store = store().await;
        let old = store
            .insert(&NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 3), 1)
            .await
            .unwrap();

        let new = store
            .replace(old, &NewChange::update("hh", "asset", "A1", json!({ "v": 1 }), 4), 2)
            .await
            .unwrap();

        assert_ne!(old, new);
        assert!(store.find_by_id(old).await.unwrap().is_none());
        let row = store.find_outstanding("asset", "A1").await.unwrap().unwrap();
        assert_eq!(row.id, new);
        assert_eq!(row.base_version, Some(4));
    }

    #[tokio::test]
    async fn test_empty_status_filters() {
        let store = store().await;
        assert!(store.list_by_statuses(&[]).await.unwrap().is_empty());
        assert_eq!(store.count_by_statuses(&[]).await.unwrap(), 0);
    }
}
