//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the household sync core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Typed event bus
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the sync engine and its
//! hosts depend on. It establishes the logging conventions, the configuration
//! builder, and the event broadcasting mechanism through which status
//! observers follow the engine.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
