//! Shared application state.
//!
//! This module provides [`AppState`], which holds the one plugin every
//! HTTP request handler drives.

use std::path::Path;
use std::sync::Arc;

use proxywasm_bridge_common::{RuntimeConfig, RuntimeError};
use proxywasm_bridge_core::{LogLevel, WasmPlugin};
use proxywasm_bridge_host::{load_plugin_file, load_plugin_wat};

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// The guest shared by every request.
    plugin: Arc<WasmPlugin>,

    /// Minimum level of guest logs reported back to clients.
    guest_log_level: LogLevel,
}

impl AppState {
    /// Create state around a started plugin.
    pub fn new(plugin: WasmPlugin) -> Self {
        Self {
            plugin: Arc::new(plugin),
            guest_log_level: LogLevel::Trace,
        }
    }

    /// Load the guest at `path` and start it.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest cannot be compiled or started.
    pub fn from_file(config: &RuntimeConfig, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        Ok(Self::new(load_plugin_file(config, path)?))
    }

    /// Start a guest from WAT text.
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest cannot be compiled or started.
    pub fn from_wat(config: &RuntimeConfig, wat: &str) -> Result<Self, RuntimeError> {
        Ok(Self::new(load_plugin_wat(config, wat)?))
    }

    /// Report only guest logs at or above `level`.
    #[must_use]
    pub fn with_guest_log_level(mut self, level: LogLevel) -> Self {
        self.guest_log_level = level;
        self
    }

    /// Get the shared plugin.
    pub fn plugin(&self) -> &Arc<WasmPlugin> {
        &self.plugin
    }

    /// Minimum level of reported guest logs.
    pub fn guest_log_level(&self) -> LogLevel {
        self.guest_log_level
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("plugin", &self.plugin)
            .field("guest_log_level", &self.guest_log_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST: &str = r#"
        (module
          (func (export "proxy_on_context_create") (param i32 i32 i32))
          (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
            i32.const 0)
          (func (export "proxy_on_done") (param i32) (result i32) i32.const 1))
    "#;

    #[test]
    fn test_app_state_from_wat() {
        let state = AppState::from_wat(&RuntimeConfig::default(), GUEST).unwrap();

        assert!(state.plugin().is_running());
        assert_eq!(state.guest_log_level(), LogLevel::Trace);
    }

    #[test]
    fn test_guest_log_level() {
        let state = AppState::from_wat(&RuntimeConfig::default(), GUEST)
            .unwrap()
            .with_guest_log_level(LogLevel::Warn);
        assert_eq!(state.guest_log_level(), LogLevel::Warn);
    }

    #[test]
    fn test_app_state_missing_file() {
        let err = AppState::from_file(&RuntimeConfig::default(), "/nonexistent.wasm").unwrap_err();
        assert!(matches!(err, RuntimeError::GuestLoad { .. }));
    }
}
