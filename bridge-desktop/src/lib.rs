//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `NetworkMonitor` using a TCP reachability probe
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, ReqwestHttpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let monitor = DesktopNetworkMonitor::with_probe("sync.example.com:443");
//!
//!     // Hand both to the core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod network;

pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
