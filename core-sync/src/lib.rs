//! # Household Sync Core
//!
//! Offline-first synchronization of household records (transactions, assets,
//! household settings) with a shared remote store.
//!
//! ## Overview
//!
//! Every local edit is written to a durable queue first and pushed later:
//! - The UI records a mutation with [`SyncEngine::enqueue`]
//! - When online, the engine drains the queue with conditional writes
//! - Version mismatches become conflicts the user resolves explicitly
//! - Typed events tell status layers what changed
//!
//! ## Components
//!
//! - **Change model** (`change`): `PendingChange`, operations, statuses and
//!   the coalescing rules
//! - **Local Change Queue** (`store`, `repository`): SQLite-backed queue with
//!   at most one outstanding entry per entity
//! - **Conflict Resolver** (`conflict_resolver`): pure version comparison
//! - **Sync State** (`state`): `idle`/`syncing`/`offline`/`error` machine
//! - **Sync Engine** (`engine`): drain loop, connectivity, timer, events
//! - **Status Observer** (`observer`): cached counts for UI layers
//! - **Remote adapters** (`remote`): in-memory store and conditional-write
//!   emulation over plain document stores

pub mod change;
pub mod conflict_resolver;
pub mod db;
pub mod engine;
pub mod error;
pub mod observer;
pub mod remote;
pub mod repository;
pub mod state;
pub mod store;

pub use change::{
    ChangeId, ChangeStatus, Coalesced, ConflictDetails, NewChange, Operation, PendingChange,
};
pub use conflict_resolver::{ConflictKind, ConflictResolver, Resolution};
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use engine::{DrainOutcome, DrainReport, SyncEngine, SyncEngineConfig, SyncSession};
pub use error::{Result, SyncError};
pub use observer::{SyncStatus, SyncStatusObserver};
pub use remote::{FaultKind, InMemoryRemoteStore, ReadCompareWriteStore};
pub use repository::{ApplyOutcome, EnqueueResult, PendingChangesRepository};
pub use state::SyncState;
pub use store::{PendingChangeStore, SqlitePendingChangeStore};
