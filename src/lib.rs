//! Workspace facade crate.
//!
//! Exposes the feature flags that map to the individual workspace crates.
//! Host applications can depend on `household-sync-workspace` and get the
//! bootstrapped service without wiring each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
