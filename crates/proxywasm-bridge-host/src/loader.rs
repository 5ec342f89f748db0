//! Plugin construction on wasmtime.

use std::path::Path;

use tracing::{info, instrument, warn};

use proxywasm_bridge_common::{RuntimeConfig, RuntimeError};
use proxywasm_bridge_core::{CompiledModule, WasmEngine, WasmPlugin, WasmtimeInstance};

/// Wire `module` into a started [`WasmPlugin`].
///
/// # Errors
///
/// Returns [`RuntimeError::GuestLoad`] if the guest fails to start.
pub fn load_plugin(
    engine: &WasmEngine,
    module: CompiledModule,
    config: &RuntimeConfig,
) -> Result<WasmPlugin, RuntimeError> {
    if !module.has_export("proxy_on_memory_allocate") && !module.has_export("malloc") {
        warn!(
            module = %module.content_hash(),
            "Guest exports no allocator; header and property values cannot be returned to it"
        );
    }

    let instance = WasmtimeInstance::new(engine, module, &config.execution);
    WasmPlugin::new(instance, &config.plugin)
}

/// Create an engine, compile the guest at `path` and start it.
///
/// # Errors
///
/// Returns an error if the engine, module or plugin cannot be created.
#[instrument(skip(config, path))]
pub fn load_plugin_file(
    config: &RuntimeConfig,
    path: impl AsRef<Path>,
) -> Result<WasmPlugin, RuntimeError> {
    let path = path.as_ref();
    let engine = WasmEngine::new(&config.engine)?;
    let module = CompiledModule::from_file(engine.inner(), path)?;
    let plugin = load_plugin(&engine, module, config)?;

    info!(path = %path.display(), root_id = plugin.root_id(), "Guest loaded");
    Ok(plugin)
}

/// Like [`load_plugin_file`], from WAT source.
///
/// This is primarily for testing purposes.
pub fn load_plugin_wat(config: &RuntimeConfig, wat: &str) -> Result<WasmPlugin, RuntimeError> {
    let engine = WasmEngine::new(&config.engine)?;
    let module = CompiledModule::from_wat(engine.inner(), wat)?;
    load_plugin(&engine, module, config)
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
    fn test_load_plugin_wat() {
        let plugin = load_plugin_wat(&RuntimeConfig::default(), GUEST).unwrap();

        assert_eq!(plugin.root_id(), 1);
        assert!(!plugin.root_created());
        assert!(plugin.is_running());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_plugin_file(&RuntimeConfig::default(), "/nonexistent/guest.wasm").unwrap_err();
        assert!(matches!(err, RuntimeError::GuestLoad { .. }));
    }

    #[test]
    fn test_load_guest_without_exports() {
        let err = load_plugin_wat(&RuntimeConfig::default(), "(module)").unwrap_err();
        assert!(matches!(err, RuntimeError::GuestLoad { .. }));
    }
}
