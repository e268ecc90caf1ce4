//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType};
use core_runtime::events::CoreEvent;
use core_sync::{
    create_test_pool, InMemoryRemoteStore, PendingChangesRepository, SyncEngine, SyncEngineConfig,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Connectivity signal flipped by the test
pub struct ManualNetworkMonitor {
    online: watch::Sender<bool>,
}

impl ManualNetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self { online }
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }
}

fn info_for(online: bool) -> NetworkInfo {
    if online {
        NetworkInfo::connected(NetworkType::WiFi)
    } else {
        NetworkInfo::disconnected()
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(info_for(*self.online.borrow()))
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(ManualChangeStream {
            receiver: self.online.subscribe(),
        }))
    }
}

struct ManualChangeStream {
    receiver: watch::Receiver<bool>,
}

#[async_trait]
impl NetworkChangeStream for ManualChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.receiver.changed().await.ok()?;
        let online = *self.receiver.borrow_and_update();
        Some(info_for(online))
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<InMemoryRemoteStore>,
    pub network: Arc<ManualNetworkMonitor>,
    pub queue: Arc<PendingChangesRepository>,
}

pub fn test_config() -> SyncEngineConfig {
    SyncEngineConfig {
        max_attempts: 3,
        operation_timeout: Duration::from_millis(250),
        sync_interval: None,
        purge_synced: false,
        own_write_cache: 64,
    }
}

pub async fn harness(online: bool) -> Harness {
    harness_with(test_config(), online).await
}

pub async fn harness_with(config: SyncEngineConfig, online: bool) -> Harness {
    let pool = create_test_pool().await.unwrap();
    let queue = Arc::new(PendingChangesRepository::new(pool).await.unwrap());
    let remote = Arc::new(InMemoryRemoteStore::new());
    let network = Arc::new(ManualNetworkMonitor::new(online));

    let engine = SyncEngine::new(config, queue.clone(), remote.clone(), network.clone());

    Harness {
        engine,
        remote,
        network,
        queue,
    }
}

/// Records every event delivered to a listener
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl EventLog {
    pub fn push(&self, event: CoreEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Wait until an event matching `predicate` was recorded.
    pub async fn wait_for<F>(&self, predicate: F) -> CoreEvent
    where
        F: Fn(&CoreEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = self.snapshot().into_iter().find(|e| predicate(e)) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected event was not emitted")
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}
