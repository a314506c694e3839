//! Shared utilities for CoentroVPN components.
//!
//! This crate provides the configuration model and logging setup shared by
//! the account service and its command-line tooling.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{AccountConfig, Config, ConfigError, IpcConfig};
