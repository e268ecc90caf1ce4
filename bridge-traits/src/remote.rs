//! Remote Document Store Abstraction
//!
//! The sync engine talks to the household's single authoritative store through
//! [`RemoteStore`]. Every record carries a `version` counter that starts at 1
//! and is bumped by exactly one on each accepted write; the store is the only
//! party allowed to increment it.
//!
//! The conditional write (`write_if_version_matches`) is the primitive the
//! whole conflict-detection design rests on. Backends that cannot perform it
//! atomically implement [`DocumentStore`] instead and are wrapped by an
//! emulating adapter in `core-sync`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;

/// Identifies one remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub household_id: String,
    pub entity_type: String,
    pub entity_id: String,
}

impl RecordKey {
    pub fn new(
        household_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            household_id: household_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.household_id, self.entity_type, self.entity_id
        )
    }
}

/// Current server-side state of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub version: u64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Result of a conditional write.
///
/// A version mismatch is a normal outcome, not an error: the store refused the
/// write and reports what it currently holds (`None` when the record does not
/// exist).
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied { new_version: u64 },
    VersionMismatch { current: Option<RemoteRecord> },
}

/// Notification that a record changed on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub key: RecordKey,
    pub version: u64,
    pub deleted: bool,
}

/// Authoritative remote store with optimistic concurrency.
///
/// # Contract
///
/// - `expected_version = None` means "the record must not exist" (create).
/// - A successful write to an existing record returns `previous + 1`; a
///   create returns `1`.
/// - Deleting returns the version the tombstone would have carried
///   (`previous + 1`). Deleting an absent record reports
///   `VersionMismatch { current: None }` whatever the expected version.
/// - Implementations must bound every call with a finite timeout or return
///   promptly; the engine additionally wraps each call in its own timeout.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the record's current version and payload, `None` if absent.
    async fn read_current_version(&self, key: &RecordKey) -> Result<Option<RemoteRecord>>;

    /// Replace the record's payload if its version equals `expected_version`.
    async fn write_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
        payload: &Value,
    ) -> Result<WriteOutcome>;

    /// Delete the record if its version equals `expected_version`.
    async fn delete_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome>;

    /// Subscribe to server-side change notifications.
    ///
    /// Stores without push support return `Ok(None)`.
    async fn subscribe_changes(&self) -> Result<Option<Box<dyn RemoteChangeStream>>> {
        Ok(None)
    }
}

/// Stream of remote change notifications
#[async_trait::async_trait]
pub trait RemoteChangeStream: Send {
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<RemoteChange>;
}

/// Plain key-value document store without conditional writes.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<RemoteRecord>>;

    async fn put(&self, key: &RecordKey, record: RemoteRecord) -> Result<()>;

    async fn remove(&self, key: &RecordKey) -> Result<()>;
}
