//! Network Monitoring Abstraction
//!
//! Provides the host's online/offline signal to the sync engine.

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }

    /// `Indeterminate` counts as online: the engine would rather attempt a
    /// drain and hit a transient failure than stall forever.
    pub fn is_online(&self) -> bool {
        !matches!(self.status, NetworkStatus::Disconnected)
    }
}

/// Network monitor trait
///
/// The sync engine uses this to:
/// - Decide its initial state (`idle` vs `offline`)
/// - Skip drains while offline
/// - Trigger a drain when connectivity comes back
///
/// # Platform Support
///
/// - **Desktop**: TCP reachability probe (see `bridge-desktop`)
/// - **Mobile**: ConnectivityManager / NWPathMonitor
/// - **Web**: `navigator.onLine` + `online`/`offline` events
#[async_trait::async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(self.get_network_info().await, Ok(info) if info.is_online())
    }

    /// Subscribe to network status changes
    ///
    /// Implementations should emit an update whenever the status changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait::async_trait]
pub trait NetworkChangeStream: Send {
    /// Get the next network info update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}
