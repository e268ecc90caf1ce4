//! # Pending Change Model
//!
//! One [`PendingChange`] row exists per queued local mutation that the remote
//! store has not yet confirmed.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending → Syncing → Synced
//!    ↑         ├────→ Conflict  (awaits manual resolution)
//!    └─────────┴────→ Failed    (retry budget exhausted / rejected)
//! ```
//!
//! `Synced`, `Conflict` and `Failed` are terminal for the drain: mark
//! operations on them are no-ops. `Pending`, `Syncing` and `Conflict` are
//! *outstanding*: at most one outstanding entry exists per entity, and new
//! mutations to that entity are coalesced into it.

use bridge_traits::RecordKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// Locally unique, monotonically increasing queue entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId(i64);

impl ChangeId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChangeId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(SyncError::InvalidOperation(s.to_string())),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Waiting for the next drain
    Pending,
    /// Remote write in flight
    Syncing,
    /// Confirmed by the remote store
    Synced,
    /// Concurrent remote write detected; awaits manual resolution
    Conflict,
    /// Exhausted retries or rejected by the remote store
    Failed,
}

impl ChangeStatus {
    /// Convert status to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// No further drain transition applies
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Conflict | Self::Failed)
    }

    /// Counts toward the one-entry-per-entity limit
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Syncing | Self::Conflict)
    }
}

impl FromStr for ChangeStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Produced when a queued mutation no longer matches the remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetails {
    /// The base version the local edit was made against
    pub local_version: Option<u64>,
    /// Current server version; 0 when the record does not exist remotely
    pub remote_version: u64,
    pub local_payload: Value,
    /// `None` when the record does not exist remotely
    pub remote_payload: Option<Value>,
}

/// A local mutation to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub household_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Full replacement snapshot, not a diff
    pub payload: Value,
    /// Version the client believed current; absent for `create`
    pub base_version: Option<u64>,
}

impl NewChange {
    pub fn create(
        household_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            household_id: household_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Create,
            payload,
            base_version: None,
        }
    }

    pub fn update(
        household_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        base_version: u64,
    ) -> Self {
        Self {
            household_id: household_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Update,
            payload,
            base_version: Some(base_version),
        }
    }

    pub fn delete(
        household_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self {
            household_id: household_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: Value::Null,
            base_version: Some(base_version),
        }
    }

    /// Checks the mutation is well-formed on its own.
    pub fn validate(&self) -> Result<()> {
        if self.household_id.is_empty() || self.entity_type.is_empty() || self.entity_id.is_empty()
        {
            return Err(SyncError::InvalidOperation(
                "household_id, entity_type and entity_id must not be empty".to_string(),
            ));
        }

        match (self.operation, self.base_version) {
            (Operation::Create, Some(_)) => Err(SyncError::InvalidOperation(format!(
                "create of {}/{} must not carry a base version",
                self.entity_type, self.entity_id
            ))),
            (Operation::Update | Operation::Delete, None) => {
                Err(SyncError::InvalidOperation(format!(
                    "{} of {}/{} requires a base version",
                    self.operation, self.entity_type, self.entity_id
                )))
            }
            (_, Some(0)) => Err(SyncError::InvalidOperation(
                "base version starts at 1".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Result of merging a new mutation into an outstanding entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced {
    pub operation: Operation,
    pub payload: Value,
    pub base_version: Option<u64>,
}

/// One queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub household_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub base_version: Option<u64>,
    pub status: ChangeStatus,
    /// Unix timestamp (ms) when first queued
    pub created_at: i64,
    /// Unix timestamp (ms) of the last change to this row
    pub updated_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Bumped on every coalesced edit; lets an in-flight write detect that
    /// the row changed underneath it
    pub revision: u32,
    /// Present while `status == Conflict`
    pub conflict: Option<ConflictDetails>,
}

impl PendingChange {
    /// Remote record targeted by this change
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.household_id, &self.entity_type, &self.entity_id)
    }

    /// Merge `incoming` into this outstanding entry.
    ///
    /// - `delete` followed by anything is rejected
    /// - anything followed by `create` is rejected
    /// - `create` + `update` stays `create` with the newer payload
    /// - `update` + `update` keeps the original base version
    /// - anything + `delete` collapses to `delete`
    pub fn coalesce_with(&self, incoming: &NewChange) -> Result<Coalesced> {
        let invalid = |reason: &str| SyncError::InvalidSequence {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            reason: reason.to_string(),
        };

        if self.operation == Operation::Delete {
            return Err(invalid("entity has an outstanding delete"));
        }

        match incoming.operation {
            Operation::Create => Err(invalid("create after an outstanding create or update")),
            Operation::Update => Ok(Coalesced {
                operation: self.operation,
                payload: incoming.payload.clone(),
                base_version: self.base_version,
            }),
            Operation::Delete => Ok(Coalesced {
                operation: Operation::Delete,
                payload: Value::Null,
                base_version: self.base_version,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outstanding(operation: Operation, base_version: Option<u64>) -> PendingChange {
        PendingChange {
            id: ChangeId::new(1),
            household_id: "hh".to_string(),
            entity_type: "asset".to_string(),
            entity_id: "A1".to_string(),
            operation,
            payload: json!({ "name": "Car" }),
            base_version,
            status: ChangeStatus::Pending,
            created_at: 0,
            updated_at: 0,
            attempt_count: 0,
            last_error: None,
            revision: 0,
            conflict: None,
        }
    }

    #[test]
    fn test_status_round_trip_and_classes() {
        for status in [
            ChangeStatus::Pending,
            ChangeStatus::Syncing,
            ChangeStatus::Synced,
            ChangeStatus::Conflict,
            ChangeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ChangeStatus>().unwrap(), status);
        }

        assert!(ChangeStatus::Conflict.is_terminal());
        assert!(ChangeStatus::Conflict.is_outstanding());
        assert!(!ChangeStatus::Synced.is_outstanding());
        assert!(!ChangeStatus::Syncing.is_terminal());
        assert!("archived".parse::<ChangeStatus>().is_err());
    }

    #[test]
    fn test_create_then_update_stays_create() {
        let existing = outstanding(Operation::Create, None);
        let incoming = NewChange::update("hh", "asset", "A1", json!({ "name": "Bike" }), 1);

        let merged = existing.coalesce_with(&incoming).unwrap();
        assert_eq!(merged.operation, Operation::Create);
        assert_eq!(merged.payload, json!({ "name": "Bike" }));
        assert_eq!(merged.base_version, None);
    }

    #[test]
    fn test_update_then_update_keeps_base() {
        let existing = outstanding(Operation::Update, Some(3));
        let incoming = NewChange::update("hh", "asset", "A1", json!({ "name": "Van" }), 4);

        let merged = existing.coalesce_with(&incoming).unwrap();
        assert_eq!(merged.operation, Operation::Update);
        assert_eq!(merged.base_version, Some(3));
    }

    #[test]
    fn test_anything_then_delete_collapses() {
        let existing = outstanding(Operation::Update, Some(2));
        let merged = existing
            .coalesce_with(&NewChange::delete("hh", "asset", "A1", 2))
            .unwrap();
        assert_eq!(merged.operation, Operation::Delete);
        assert_eq!(merged.base_version, Some(2));
        assert_eq!(merged.payload, Value::Null);
    }

    #[test]
    fn test_invalid_sequences() {
        let deleted = outstanding(Operation::Delete, Some(2));
        let err = deleted
            .coalesce_with(&NewChange::update("hh", "asset", "A1", json!({}), 2))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidSequence { .. }));

        let updated = outstanding(Operation::Update, Some(2));
        let err = updated
            .coalesce_with(&NewChange::create("hh", "asset", "A1", json!({})))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidSequence { .. }));
    }

    #[test]
    fn test_new_change_validation() {
        assert!(NewChange::create("hh", "transaction", "T9", json!({})).validate().is_ok());

        let mut bad_create = NewChange::create("hh", "transaction", "T9", json!({}));
        bad_create.base_version = Some(1);
        assert!(bad_create.validate().is_err());

        let mut bad_update = NewChange::update("hh", "asset", "A1", json!({}), 1);
        bad_update.base_version = None;
        assert!(bad_update.validate().is_err());

        assert!(NewChange::update("hh", "asset", "A1", json!({}), 0).validate().is_err());
        assert!(NewChange::create("", "asset", "A1", json!({})).validate().is_err());
    }

    #[test]
    fn test_key() {
        let change = outstanding(Operation::Update, Some(1));
        assert_eq!(change.key().to_string(), "hh/asset/A1");
    }
}
