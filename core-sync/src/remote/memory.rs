//! In-process authoritative store.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, Clock, RecordKey, RemoteChange, RemoteChangeStream, RemoteRecord, RemoteStore,
    SystemClock, WriteOutcome,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::BroadcastChangeStream;

const CHANGE_BUFFER: usize = 256;

/// Failure to inject into the next remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection-level failure (`BridgeError::Network`)
    Transient,
    /// Server refusal with the given status (`BridgeError::Rejected`)
    Rejected(u16),
    /// The call hangs well past any sane timeout
    Hang,
}

/// Versioned records held in memory with atomic conditional writes.
///
/// Each accepted write bumps the record's version by exactly one and
/// publishes a [`RemoteChange`]. `updated_at` comes from the injected clock.
pub struct InMemoryRemoteStore {
    records: Mutex<HashMap<RecordKey, RemoteRecord>>,
    changes: broadcast::Sender<RemoteChange>,
    clock: Arc<dyn Clock>,
    faults: Mutex<VecDeque<FaultKind>>,
    latency_ms: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
            clock,
            faults: Mutex::new(VecDeque::new()),
            latency_ms: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Put a record in place without notifying subscribers.
    pub async fn seed(&self, key: RecordKey, version: u64, payload: Value) {
        let record = RemoteRecord {
            version,
            payload,
            updated_at: self.clock.now(),
        };
        self.records.lock().await.insert(key, record);
    }

    /// Write as another device would: unconditional, version bumped, change
    /// published. Returns the new version.
    pub async fn simulate_remote_write(&self, key: &RecordKey, payload: Value) -> u64 {
        let version = {
            let mut records = self.records.lock().await;
            let version = records.get(key).map(|r| r.version + 1).unwrap_or(1);
            records.insert(
                key.clone(),
                RemoteRecord {
                    version,
                    payload,
                    updated_at: self.clock.now(),
                },
            );
            version
        };

        self.publish(key, version, false);
        version
    }

    /// Delete as another device would. Returns whether the record existed.
    pub async fn simulate_remote_delete(&self, key: &RecordKey) -> bool {
        let removed = self.records.lock().await.remove(key);
        if let Some(record) = &removed {
            self.publish(key, record.version + 1, true);
        }
        removed.is_some()
    }

    /// Current record, bypassing faults and counters
    pub async fn get(&self, key: &RecordKey) -> Option<RemoteRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Fail the next remote call with `fault`. Calls queue up in order.
    pub async fn fail_next(&self, fault: FaultKind) {
        self.faults.lock().await.push_back(fault);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Conditional writes and deletes attempted (including faulted ones)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn publish(&self, key: &RecordKey, version: u64, deleted: bool) {
        // No subscribers is fine
        let _ = self.changes.send(RemoteChange {
            key: key.clone(),
            version,
            deleted,
        });
    }

    async fn before_call(&self) -> BridgeResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let fault = self.faults.lock().await.pop_front();
        match fault {
            None => Ok(()),
            Some(FaultKind::Transient) => Err(BridgeError::Network(
                "injected connection failure".to_string(),
            )),
            Some(FaultKind::Rejected(status)) => Err(BridgeError::Rejected {
                status,
                message: "injected rejection".to_string(),
            }),
            Some(FaultKind::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BridgeError::Timeout(3_600_000))
            }
        }
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn read_current_version(&self, key: &RecordKey) -> BridgeResult<Option<RemoteRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn write_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
        payload: &Value,
    ) -> BridgeResult<WriteOutcome> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let new_version = {
            let mut records = self.records.lock().await;
            let current = records.get(key);

            let new_version = match (expected_version, current) {
                (None, None) => 1,
                (Some(expected), Some(record)) if record.version == expected => expected + 1,
                (_, current) => {
                    debug!(
                        key = %key,
                        expected = ?expected_version,
                        actual = ?current.map(|r| r.version),
                        "Conditional write refused"
                    );
                    return Ok(WriteOutcome::VersionMismatch {
                        current: current.cloned(),
                    });
                }
            };

            records.insert(
                key.clone(),
                RemoteRecord {
                    version: new_version,
                    payload: payload.clone(),
                    updated_at: self.clock.now(),
                },
            );
            new_version
        };

        self.publish(key, new_version, false);
        Ok(WriteOutcome::Applied { new_version })
    }

    async fn delete_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
    ) -> BridgeResult<WriteOutcome> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let new_version = {
            let mut records = self.records.lock().await;
            match records.get(key) {
                Some(record) if Some(record.version) == expected_version => {
                    let new_version = record.version + 1;
                    records.remove(key);
                    new_version
                }
                current => {
                    return Ok(WriteOutcome::VersionMismatch {
                        current: current.cloned(),
                    });
                }
            }
        };

        self.publish(key, new_version, true);
        Ok(WriteOutcome::Applied { new_version })
    }

    async fn subscribe_changes(&self) -> BridgeResult<Option<Box<dyn RemoteChangeStream>>> {
        Ok(Some(Box::new(BroadcastChangeStream::new(
            self.changes.subscribe(),
        ))))
    }
}
