//! # Host Bridge Traits
//!
//! Platform and remote abstraction traits for the household sync core.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync core and everything it
//! does not own: the host's connectivity signal, the household's remote
//! document store, the HTTP transport used to reach it, the clock, and the
//! host logger. Each trait is implemented per platform or per backend.
//!
//! ## Traits
//!
//! ### Remote store
//! - [`RemoteStore`](remote::RemoteStore) - Versioned records with conditional writes
//! - [`DocumentStore`](remote::DocumentStore) - Plain key-value store (no conditional writes)
//! - [`HttpClient`](http::HttpClient) - Async HTTP transport for REST backends
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Online/offline detection and change stream
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! must classify failures: transport problems become `Network`/`Timeout`
//! (the engine retries them), refusals become `Rejected` (the engine gives up
//! on that entry immediately).
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across async tasks behind `Arc`.

pub mod error;
pub mod http;
pub mod network;
pub mod remote;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use remote::{
    DocumentStore, RecordKey, RemoteChange, RemoteChangeStream, RemoteRecord, RemoteStore,
    WriteOutcome,
};
pub use time::{Clock, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
