//! Common types, errors, and configuration for proxywasm-bridge.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror` for the guest lifecycle and host capabilities
//! - Configuration structures for the engine, guest execution and plugin
//! - The TOML configuration file loaded by the binary

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, PluginConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{HeaderMapError, HostFunctionError, RuntimeError};
