//! # Core Configuration Module
//!
//! Provides configuration management for the household sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance holding the bridges and settings the sync engine needs. It
//! enforces fail-fast validation so a misconfigured engine never starts.
//!
//! ## Dependencies
//!
//! - `HttpClient` - Transport for the REST remote store (desktop default: reqwest)
//! - `NetworkMonitor` - Online/offline signal (desktop default: TCP probe of
//!   the remote host)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults are
//! injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SyncSettings};
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/queue.db")
//!     .remote_base_url("https://sync.example.com/api")
//!     .sync_settings(SyncSettings::default().with_max_attempts(3))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Missing remote base URL
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/queue.db")
//!     .build()
//!     .expect("Should fail - remote base URL is required");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{HttpClient, NetworkMonitor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for a single remote operation.
const MAX_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Transient failures tolerated per entry before it is marked `failed`
    pub max_attempts: u32,

    /// Finite timeout applied to every remote read/write
    pub operation_timeout: Duration,

    /// Periodic drain interval; `None` disables the timer
    pub sync_interval: Option<Duration>,

    /// Delete `synced` rows after each drain instead of archiving them
    pub purge_synced: bool,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            operation_timeout: Duration::from_secs(30),
            sync_interval: Some(Duration::from_secs(300)),
            purge_synced: true,
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl SyncSettings {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_purge_synced(mut self, purge: bool) -> Self {
        self.purge_synced = purge;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validates the settings
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.operation_timeout.is_zero() {
            return Err(Error::Config(
                "operation_timeout must be greater than zero; remote operations need a finite, \
                 non-zero bound"
                    .to_string(),
            ));
        }

        if self.operation_timeout > MAX_OPERATION_TIMEOUT {
            return Err(Error::Config(format!(
                "operation_timeout exceeds maximum of {} seconds",
                MAX_OPERATION_TIMEOUT.as_secs()
            )));
        }

        if let Some(interval) = self.sync_interval {
            if interval < Duration::from_secs(1) {
                return Err(Error::Config(
                    "sync_interval must be at least 1 second. Use None to disable the timer."
                        .to_string(),
                ));
            }
        }

        if self.event_buffer == 0 {
            return Err(Error::Config(
                "event_buffer must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Core configuration for the household sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database holding the pending change queue
    pub database_path: PathBuf,

    /// Base URL of the household REST store, without trailing slash
    pub remote_base_url: String,

    /// HTTP transport for the remote store
    pub http_client: Arc<dyn HttpClient>,

    /// Connectivity signal
    pub network_monitor: Arc<dyn NetworkMonitor>,

    /// Human-readable device label, attached to log spans
    pub device_label: String,

    pub sync: SyncSettings,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("remote_base_url", &self.remote_base_url)
            .field("http_client", &"HttpClient { ... }")
            .field("network_monitor", &"NetworkMonitor { ... }")
            .field("device_label", &self.device_label)
            .field("sync", &self.sync)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Remote base URL is an http(s) URL
    /// - Sync settings are within bounds
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if !(self.remote_base_url.starts_with("https://")
            || self.remote_base_url.starts_with("http://"))
        {
            return Err(Error::Config(format!(
                "Remote base URL must start with http:// or https://, got '{}'",
                self.remote_base_url
            )));
        }

        if probe_address(&self.remote_base_url).is_none() {
            return Err(Error::Config(format!(
                "Remote base URL '{}' has no host",
                self.remote_base_url
            )));
        }

        if self.device_label.trim().is_empty() {
            return Err(Error::Config("Device label cannot be empty".to_string()));
        }

        self.sync.validate()
    }
}

/// Derive a `host:port` reachability probe target from an http(s) URL.
pub fn probe_address(url: &str) -> Option<String> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    // Drop userinfo if present
    let host_port = authority.rsplit('@').next().unwrap_or(authority);

    if host_port.is_empty() {
        return None;
    }

    let has_port = match host_port.rfind(':') {
        // IPv6 literals contain colons inside brackets
        Some(idx) => !host_port[idx..].contains(']'),
        None => false,
    };

    if has_port {
        Some(host_port.to_string())
    } else {
        Some(format!("{}:{}", host_port, default_port))
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the remote store. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Mobile/Web: inject the platform HTTP stack."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn network_monitor_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "NetworkMonitor".to_string(),
        message: "NetworkMonitor implementation is required to detect offline periods. \
                 Desktop: enable the 'desktop-shims' feature to use the default DesktopNetworkMonitor. \
                 Mobile: inject ConnectivityManager / NWPathMonitor. \
                 Web: inject a navigator.onLine based monitor."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout).map_err(|e| {
        Error::Internal(format!("Failed to create default HttpClient: {}", e))
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor(remote_base_url: &str) -> Result<Arc<dyn NetworkMonitor>> {
    use bridge_desktop::DesktopNetworkMonitor;

    let monitor = match probe_address(remote_base_url) {
        Some(addr) => DesktopNetworkMonitor::with_probe(addr),
        None => DesktopNetworkMonitor::new(),
    };
    Ok(Arc::new(monitor))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor(_remote_base_url: &str) -> Result<Arc<dyn NetworkMonitor>> {
    Err(network_monitor_missing_error())
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) to validate and create the
/// final config.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    remote_base_url: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    device_label: Option<String>,
    sync: Option<SyncSettings>,
}

impl CoreConfigBuilder {
    /// Sets the path of the SQLite queue database.
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().database_path("/path/to/queue.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the base URL of the remote store. A trailing slash is trimmed.
    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.remote_base_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the network monitor implementation.
    ///
    /// If not provided, the desktop default probing the remote host will be
    /// used when the `desktop-shims` feature is enabled.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Default: `"desktop"`
    pub fn device_label(mut self, label: impl Into<String>) -> Self {
        self.device_label = Some(label.into());
        self
    }

    pub fn sync_settings(mut self, settings: SyncSettings) -> Self {
        self.sync = Some(settings);
        self
    }

    /// Builds the final `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Database path or remote base URL is missing
    /// - A required bridge is missing and no desktop default is available
    /// - Validation fails
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let remote_base_url = self.remote_base_url.ok_or_else(|| {
            Error::Config(
                "Remote base URL is required. Use .remote_base_url() to set it.".to_string(),
            )
        })?;

        let sync = self.sync.unwrap_or_default();
        sync.validate()?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(sync.operation_timeout)?,
        };

        let network_monitor = match self.network_monitor {
            Some(monitor) => monitor,
            None => provide_default_network_monitor(&remote_base_url)?,
        };

        let config = CoreConfig {
            database_path,
            remote_base_url,
            http_client,
            network_monitor,
            device_label: self.device_label.unwrap_or_else(|| "desktop".to_string()),
            sync,
        };

        config.validate()?;

        Ok(config)
    }
}
