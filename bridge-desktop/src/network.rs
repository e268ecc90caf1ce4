//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default endpoint probed for reachability
const DEFAULT_PROBE_ADDR: &str = "1.1.1.1:443";

/// Desktop network monitor implementation
///
/// Detects connectivity by opening a TCP connection to a probe address
/// (normally the remote store's host). Desktop platforms have no portable
/// push API for link changes, so the change stream polls.
#[derive(Clone)]
pub struct DesktopNetworkMonitor {
    probe_addr: String,
    probe_timeout: Duration,
    poll_interval: Duration,
    cached_info: Arc<Mutex<Option<NetworkInfo>>>,
}

impl DesktopNetworkMonitor {
    /// Create a new network monitor probing the default address
    pub fn new() -> Self {
        Self::with_probe(DEFAULT_PROBE_ADDR)
    }

    /// Probe a specific `host:port`, typically the remote store endpoint
    pub fn with_probe(probe_addr: impl Into<String>) -> Self {
        Self {
            probe_addr: probe_addr.into(),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            cached_info: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Last probed status without probing again
    pub async fn cached_info(&self) -> Option<NetworkInfo> {
        self.cached_info.lock().await.clone()
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(self.probe_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) => NetworkStatus::Disconnected,
            Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let status = self.check_connectivity().await;

        let info = match status {
            // Desktop cannot tell WiFi from Ethernet without platform APIs
            NetworkStatus::Connected => NetworkInfo::connected(NetworkType::Other),
            _ => NetworkInfo::disconnected(),
        };

        *self.cached_info.lock().await = Some(info.clone());
        debug!(status = ?status, probe = %self.probe_addr, "Network info updated");

        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        let initial = self.get_network_info().await?;
        Ok(Box::new(DesktopNetworkChangeStream {
            monitor: self.clone(),
            last_status: Some(initial.status),
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    monitor: DesktopNetworkMonitor,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.monitor.poll_interval).await;

            if let Ok(info) = self.monitor.get_network_info().await {
                if self.last_status.as_ref() != Some(&info.status) {
                    self.last_status = Some(info.status);
                    return Some(info);
                }
            }
        }
    }
}
