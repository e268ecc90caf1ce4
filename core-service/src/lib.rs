//! Core service façade and bootstrap helpers.
//!
//! This crate wires a validated [`CoreConfig`] into a ready [`SyncEngine`]:
//! the SQLite change queue at `database_path`, the REST remote store at
//! `remote_base_url`, and the host's HTTP and connectivity bridges. Desktop
//! apps typically enable the `desktop-shims` feature, which lets the config
//! fall back to the `bridge-desktop` implementations; other hosts inject
//! their own bridges through the config builder.
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/data/household-queue.db")
//!     .remote_base_url("https://sync.example.com/v1")
//!     .build()?;
//!
//! let core = CoreService::bootstrap(config).await?;
//! core.start_session("household-1", "user-7").await?;
//! let observer = core.observer().await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

pub use core_runtime::config::{CoreConfig, CoreConfigBuilder, SyncSettings};
pub use core_runtime::events::{CoreEvent, QueueEvent, SyncEvent};
pub use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
pub use core_sync::{
    ChangeId, ChangeStatus, DrainOutcome, Operation, PendingChange, SyncEngine, SyncState,
    SyncStatus, SyncStatusObserver,
};

use std::sync::Arc;

use bridge_traits::RemoteStore;
use core_runtime::events::EventBus;
use core_sync::{create_pool, DatabaseConfig, PendingChangesRepository, SyncEngineConfig};
use provider_rest::{RestRemoteStore, RestStoreConfig};
use tracing::{info, instrument};

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    engine: SyncEngine,
}

impl CoreService {
    /// Open the queue database and connect the engine to the REST store
    /// described by `config`.
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        let remote = RestRemoteStore::new(
            config.http_client.clone(),
            RestStoreConfig::new(config.remote_base_url.clone())
                .request_timeout(config.sync.operation_timeout),
        )?;

        Self::bootstrap_with_remote(config, Arc::new(remote)).await
    }

    /// Same as [`bootstrap`](Self::bootstrap) with a host-supplied remote
    /// store, e.g. a `ReadCompareWriteStore` over a plain document database.
    #[instrument(skip_all, fields(device = %config.device_label))]
    pub async fn bootstrap_with_remote(
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = create_pool(DatabaseConfig::new(config.database_path.clone()))
            .await
            .map_err(|e| CoreError::InitializationFailed(format!("queue database: {}", e)))?;
        let queue = Arc::new(PendingChangesRepository::new(pool).await?);

        let engine = SyncEngine::new(
            SyncEngineConfig::from(&config.sync),
            queue,
            remote,
            config.network_monitor.clone(),
        )
        .with_event_bus(EventBus::new(config.sync.event_buffer));

        info!(database = %config.database_path.display(), "Core service ready");

        Ok(Self {
            config: Arc::new(config),
            engine,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Start syncing at login.
    pub async fn start_session(&self, household_id: &str, user_id: &str) -> Result<DrainOutcome> {
        Ok(self.engine.start_sync(household_id, user_id).await?)
    }

    /// Stop syncing at logout. Queued changes stay on disk for the next
    /// session.
    pub async fn end_session(&self) {
        self.engine.stop().await;
    }

    /// Status cache for UI layers.
    pub async fn observer(&self) -> Result<SyncStatusObserver> {
        Ok(SyncStatusObserver::attach(self.engine.clone()).await?)
    }
}
