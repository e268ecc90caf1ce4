//! Conditional writes emulated over a plain document store.
//!
//! For backends that can only get, put and remove documents. Each write
//! reads the current document, compares its version with the expected one
//! and writes the replacement only on a match.
//!
//! # Known limitation
//!
//! Writers inside this process are serialised by a mutex, so they never
//! interleave. Another process writing the same backend between our read and
//! our put is *not* detected: its write is silently overwritten and both
//! sides believe they produced the same version. Use a backend with native
//! conditional writes where that window matters.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    Clock, DocumentStore, RecordKey, RemoteChange, RemoteChangeStream, RemoteRecord, RemoteStore,
    SystemClock, WriteOutcome,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::BroadcastChangeStream;

/// [`RemoteStore`] emulating `write_if_version_matches` via
/// read-then-compare-then-write on a [`DocumentStore`].
pub struct ReadCompareWriteStore<D: DocumentStore> {
    inner: D,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<RemoteChange>,
}

impl<D: DocumentStore> ReadCompareWriteStore<D> {
    pub fn new(inner: D) -> Self {
        Self::with_clock(inner, Arc::new(SystemClock))
    }

    pub fn with_clock(inner: D, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner,
            clock,
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn publish(&self, key: &RecordKey, version: u64, deleted: bool) {
        let _ = self.changes.send(RemoteChange {
            key: key.clone(),
            version,
            deleted,
        });
    }
}

#[async_trait]
impl<D: DocumentStore> RemoteStore for ReadCompareWriteStore<D> {
    async fn read_current_version(&self, key: &RecordKey) -> BridgeResult<Option<RemoteRecord>> {
        self.inner.get(key).await
    }

    async fn write_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
        payload: &Value,
    ) -> BridgeResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;

        let current = self.inner.get(key).await?;
        let matched = match (expected_version, current.as_ref()) {
            (None, None) => Some(1),
            (Some(expected), Some(record)) if record.version == expected => Some(expected + 1),
            _ => None,
        };
        let Some(new_version) = matched else {
            debug!(
                key = %key,
                expected = ?expected_version,
                actual = ?current.as_ref().map(|r| r.version),
                "Emulated conditional write refused"
            );
            return Ok(WriteOutcome::VersionMismatch { current });
        };

        // Race window: another process may write between the get above and
        // this put.
        self.inner
            .put(
                key,
                RemoteRecord {
                    version: new_version,
                    payload: payload.clone(),
                    updated_at: self.clock.now(),
                },
            )
            .await?;

        self.publish(key, new_version, false);
        Ok(WriteOutcome::Applied { new_version })
    }

    async fn delete_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
    ) -> BridgeResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;

        let current = self.inner.get(key).await?;
        let matched = current
            .as_ref()
            .filter(|record| Some(record.version) == expected_version)
            .map(|record| record.version + 1);
        let Some(new_version) = matched else {
            return Ok(WriteOutcome::VersionMismatch { current });
        };

        self.inner.remove(key).await?;

        self.publish(key, new_version, true);
        Ok(WriteOutcome::Applied { new_version })
    }

    async fn subscribe_changes(&self) -> BridgeResult<Option<Box<dyn RemoteChangeStream>>> {
        Ok(Some(Box::new(BroadcastChangeStream::new(
            self.changes.subscribe(),
        ))))
    }
}
