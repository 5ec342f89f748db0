//! Configuration structures for proxywasm-bridge.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings
//! - [`ExecutionConfig`]: Per-call limits applied to the guest instance
//! - [`PluginConfig`]: Exclusive-ownership settings for the shared guest

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Guest execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Plugin (shared guest) configuration.
    #[serde(default)]
    pub plugin: PluginConfig,
}

/// Wasmtime engine configuration.
///
/// These settings are fixed for the lifetime of the engine and every
/// module compiled with it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable fuel metering.
    ///
    /// When enabled, every guest export call is limited by
    /// [`ExecutionConfig::max_fuel`].
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Compile with Cranelift speed optimizations.
    #[serde(default = "defaults::optimize")]
    pub optimize: bool,

    /// Maximum guest stack size in kilobytes.
    #[serde(default = "defaults::max_wasm_stack_kb")]
    pub max_wasm_stack_kb: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fuel_metering: defaults::fuel_metering(),
            optimize: defaults::optimize(),
            max_wasm_stack_kb: defaults::max_wasm_stack_kb(),
        }
    }
}

/// Guest execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fuel granted to each guest export call.
    ///
    /// Only effective when [`EngineConfig::fuel_metering`] is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Maximum linear memory of the guest in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Forward guest stdout/stderr (WASI) to the host process.
    #[serde(default = "defaults::inherit_stdio")]
    pub inherit_stdio: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            max_memory_mb: defaults::max_memory_mb(),
            inherit_stdio: defaults::inherit_stdio(),
        }
    }
}

impl ExecutionConfig {
    /// Get the memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Shared guest configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Upper bound on waiting for exclusive ownership of the guest.
    ///
    /// `None` waits indefinitely.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

impl PluginConfig {
    /// Get the lock timeout as a `Duration`.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn optimize() -> bool {
        true
    }

    pub const fn max_wasm_stack_kb() -> usize {
        512
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn inherit_stdio() -> bool {
        true
    }
}
