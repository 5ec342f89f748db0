//! Guest instance lifecycle management.
//!
//! This module provides the [`GuestInstance`] boundary and
//! [`WasmtimeInstance`], its implementation on wasmtime:
//!
//! 1. Register host imports on the linker
//! 2. Instantiate the module and run its initializer
//! 3. Resolve the proxy-wasm exports
//! 4. Invoke exports with per-call fuel, mapping traps to errors

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Instance, Linker, Store, Trap, TypedFunc};

use crate::abi::{Action, ContextId, ContextType};
use crate::handler::ImportsHandler;
use crate::linker;
use crate::store::{HostState, create_store};
use crate::{CompiledModule, WasmEngine};
use proxywasm_bridge_common::{ExecutionConfig, RuntimeError};

/// Engine boundary for one guest instance.
///
/// Implementations are not required to be safe for concurrent use; callers
/// serialize access through [`AbiContext`](crate::AbiContext) and the
/// plugin's ownership guard.
pub trait GuestInstance: Send {
    /// Register host imports. Must precede [`start`](Self::start).
    fn register_imports(&mut self) -> Result<(), RuntimeError>;

    /// Instantiate the guest and resolve its exports.
    fn start(&mut self) -> Result<(), RuntimeError>;

    /// Stop the guest. Further export calls fail.
    fn stop(&mut self);

    /// Whether exports can currently be invoked.
    fn is_running(&self) -> bool;

    /// Install `handler` for host imports, returning the previous one.
    fn set_handler(&mut self, handler: Box<dyn ImportsHandler>) -> Box<dyn ImportsHandler>;

    /// Create a context inside the guest.
    fn proxy_on_context_create(
        &mut self,
        context_id: ContextId,
        parent_id: ContextId,
        kind: ContextType,
    ) -> Result<(), RuntimeError>;

    /// Deliver request headers to an HTTP context.
    fn proxy_on_request_headers(
        &mut self,
        context_id: ContextId,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<Action, RuntimeError>;

    /// Ask the guest to tear down a context.
    ///
    /// Returns `true` when teardown may proceed immediately.
    fn proxy_on_done(&mut self, context_id: ContextId) -> Result<bool, RuntimeError>;
}

/// Lifecycle state of a [`WasmtimeInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Not instantiated yet.
    Created,
    /// Exports may be invoked.
    Running,
    /// Stopped explicitly or after the guest was interrupted.
    Stopped,
}

/// `proxy_on_context_create` in either of its published shapes.
#[derive(Clone)]
enum ContextCreate {
    /// `(context_id, parent_id, context_type)`
    WithKind(TypedFunc<(i32, i32, i32), ()>),
    /// `(context_id, parent_id)`
    Legacy(TypedFunc<(i32, i32), ()>),
}

/// Typed proxy-wasm exports resolved at start.
#[derive(Clone)]
struct GuestExports {
    context_create: ContextCreate,
    on_request_headers: TypedFunc<(i32, i32, i32), i32>,
    on_done: TypedFunc<i32, i32>,
}

impl GuestExports {
    fn resolve(instance: &Instance, store: &mut Store<HostState>) -> Result<Self, RuntimeError> {
        let context_create = if let Ok(func) =
            instance.get_typed_func::<(i32, i32, i32), ()>(&mut *store, "proxy_on_context_create")
        {
            ContextCreate::WithKind(func)
        } else {
            let func = instance
                .get_typed_func::<(i32, i32), ()>(&mut *store, "proxy_on_context_create")
                .map_err(|e| missing_export("proxy_on_context_create", &e))?;
            ContextCreate::Legacy(func)
        };

        let on_request_headers = instance
            .get_typed_func::<(i32, i32, i32), i32>(&mut *store, "proxy_on_request_headers")
            .map_err(|e| missing_export("proxy_on_request_headers", &e))?;

        let on_done = instance
            .get_typed_func::<i32, i32>(&mut *store, "proxy_on_done")
            .map_err(|e| missing_export("proxy_on_done", &e))?;

        Ok(Self {
            context_create,
            on_request_headers,
            on_done,
        })
    }
}

/// A proxy-wasm guest running on wasmtime.
///
/// Owns the store, so all guest state lives here. Every export call gets a
/// fresh fuel budget when the engine meters fuel.
pub struct WasmtimeInstance {
    module: CompiledModule,
    linker: Linker<HostState>,
    store: Store<HostState>,
    exports: Option<GuestExports>,
    config: ExecutionConfig,
    fuel_metered: bool,
    state: InstanceState,
}

impl WasmtimeInstance {
    /// Create an instance for `module`. Nothing runs until [`start`](GuestInstance::start).
    pub fn new(engine: &WasmEngine, module: CompiledModule, config: &ExecutionConfig) -> Self {
        Self {
            module,
            linker: Linker::new(engine.inner()),
            store: create_store(engine, config),
            exports: None,
            config: config.clone(),
            fuel_metered: engine.is_fuel_metered(),
            state: InstanceState::Created,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    fn refuel(&mut self) -> Result<(), RuntimeError> {
        if self.fuel_metered {
            self.store
                .set_fuel(self.config.max_fuel)
                .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }
        Ok(())
    }

    /// Invoke an export with a fresh fuel budget.
    fn call<R>(
        &mut self,
        export: &'static str,
        invoke: impl FnOnce(&GuestExports, &mut Store<HostState>) -> wasmtime::Result<R>,
    ) -> Result<R, RuntimeError> {
        if self.state != InstanceState::Running {
            return Err(RuntimeError::unhealthy(format!(
                "cannot call {export}: instance is {:?}",
                self.state
            )));
        }

        self.refuel()?;
        let Some(exports) = self.exports.as_ref() else {
            return Err(RuntimeError::unhealthy(format!(
                "cannot call {export}: exports not resolved"
            )));
        };

        let start = Instant::now();
        let result = invoke(exports, &mut self.store);

        match result {
            Ok(value) => {
                debug!(
                    export,
                    duration_us = start.elapsed().as_micros(),
                    "Guest export returned"
                );
                Ok(value)
            }
            Err(err) => Err(self.guest_failure(export, &err)),
        }
    }

    fn guest_failure(&mut self, export: &'static str, err: &wasmtime::Error) -> RuntimeError {
        if is_out_of_fuel(err) {
            warn!(
                export,
                max_fuel = self.config.max_fuel,
                "Guest interrupted: fuel exhausted, stopping instance"
            );
            self.stop();
            return RuntimeError::FuelExhausted;
        }

        let (message, code) = extract_trap_info(err);
        error!(export, trap_message = %message, "Guest export trapped");
        RuntimeError::GuestTrap { message, code }
    }

    /// Run the reactor or command initializer if the guest exports one.
    fn initialize(&mut self, instance: &Instance) -> Result<(), RuntimeError> {
        for entry in ["_initialize", "_start"] {
            let Ok(func) = instance.get_typed_func::<(), ()>(&mut self.store, entry) else {
                continue;
            };

            debug!(entry, "Running guest initializer");
            self.refuel()?;
            return match func.call(&mut self.store, ()) {
                Ok(()) => Ok(()),
                Err(e) if exited_cleanly(&e) => Ok(()),
                Err(e) => Err(RuntimeError::guest_load(format!("{entry} failed: {e}"))),
            };
        }
        Ok(())
    }
}

impl GuestInstance for WasmtimeInstance {
    fn register_imports(&mut self) -> Result<(), RuntimeError> {
        linker::register_all(&mut self.linker)
    }

    #[instrument(skip(self), fields(module = %self.module.content_hash()))]
    fn start(&mut self) -> Result<(), RuntimeError> {
        if self.state != InstanceState::Created {
            return Err(RuntimeError::invalid_state(format!(
                "cannot start an instance that is {:?}",
                self.state
            )));
        }

        let start = Instant::now();

        linker::define_unimplemented(&mut self.linker, &mut self.store, self.module.as_module())?;

        // Anything still unresolved traps when called.
        self.linker
            .define_unknown_imports_as_traps(self.module.as_module())
            .map_err(|e| RuntimeError::guest_load(format!("Failed to link guest: {e}")))?;

        let instance = self
            .linker
            .instantiate(&mut self.store, self.module.as_module())
            .map_err(|e| RuntimeError::guest_load(format!("Instantiation failed: {e}")))?;

        self.initialize(&instance)?;
        self.exports = Some(GuestExports::resolve(&instance, &mut self.store)?);
        self.state = InstanceState::Running;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Guest instance started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.state != InstanceState::Stopped {
            info!("Guest instance stopped");
        }
        self.state = InstanceState::Stopped;
        self.exports = None;
        self.store
            .data_mut()
            .set_handler(Box::new(crate::DefaultImportsHandler));
    }

    fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    fn set_handler(&mut self, handler: Box<dyn ImportsHandler>) -> Box<dyn ImportsHandler> {
        self.store.data_mut().set_handler(handler)
    }

    fn proxy_on_context_create(
        &mut self,
        context_id: ContextId,
        parent_id: ContextId,
        kind: ContextType,
    ) -> Result<(), RuntimeError> {
        self.call("proxy_on_context_create", |exports, store| {
            match &exports.context_create {
                ContextCreate::WithKind(func) => {
                    func.call(store, (context_id, parent_id, kind.as_i32()))
                }
                ContextCreate::Legacy(func) => func.call(store, (context_id, parent_id)),
            }
        })
    }

    fn proxy_on_request_headers(
        &mut self,
        context_id: ContextId,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<Action, RuntimeError> {
        let header_count = i32::try_from(header_count).map_err(|_| {
            RuntimeError::invalid_state(format!("header count {header_count} exceeds i32"))
        })?;

        let raw = self.call("proxy_on_request_headers", |exports, store| {
            exports
                .on_request_headers
                .call(store, (context_id, header_count, i32::from(end_of_stream)))
        })?;
        Ok(Action::from_i32(raw))
    }

    fn proxy_on_done(&mut self, context_id: ContextId) -> Result<bool, RuntimeError> {
        let raw = self.call("proxy_on_done", |exports, store| {
            exports.on_done.call(store, context_id)
        })?;
        Ok(raw != 0)
    }
}

impl std::fmt::Debug for WasmtimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeInstance")
            .field("module", &self.module)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn missing_export(name: &str, err: &wasmtime::Error) -> RuntimeError {
    RuntimeError::guest_load(format!("Required export '{name}' unavailable: {err}"))
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = error.to_string();
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));

    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

/// A command guest calling `proc_exit(0)` from `_start` is not a failure.
fn exited_cleanly(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<wasmtime_wasi::I32Exit>()
        .is_some_and(|exit| exit.0 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::LogLevel;
    use crate::handler::{DefaultImportsHandler, HostResult};
    use proxywasm_bridge_common::EngineConfig;

    const GUEST: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $created (mut i32) (i32.const 0))
          (func (export "proxy_on_context_create") (param i32 i32 i32)
            (global.set $created (local.get 0)))
          (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
            (if (i32.eq (local.get 1) (i32.const 99)) (then unreachable))
            (if (i32.eq (local.get 1) (i32.const 77)) (then (loop $spin (br $spin))))
            (global.get $created))
          (func (export "proxy_on_done") (param i32) (result i32)
            (i32.const 1)))
    "#;

    fn instance_for(wat: &str) -> WasmtimeInstance {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        let config = ExecutionConfig {
            max_fuel: 100_000,
            ..Default::default()
        };
        WasmtimeInstance::new(&engine, module, &config)
    }

    fn started(wat: &str) -> WasmtimeInstance {
        let mut instance = instance_for(wat);
        instance.register_imports().unwrap();
        instance.start().unwrap();
        instance
    }

    #[test]
    fn test_calls_before_start_are_unhealthy() {
        let mut instance = instance_for(GUEST);

        assert_eq!(instance.state(), InstanceState::Created);
        let err = instance
            .proxy_on_context_create(1, 0, ContextType::PluginContext)
            .unwrap_err();
        assert!(err.is_unhealthy());
    }

    #[test]
    fn test_start_and_dispatch() {
        let mut instance = started(GUEST);
        assert!(instance.is_running());

        instance
            .proxy_on_context_create(7, 1, ContextType::HttpContext)
            .unwrap();
        let action = instance.proxy_on_request_headers(7, 0, true).unwrap();
        assert_eq!(action, Action::Unknown(7));
        assert!(instance.proxy_on_done(7).unwrap());
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let mut instance = started(GUEST);
        let err = instance.start().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
    }

    #[test]
    fn test_legacy_context_create() {
        let mut instance = started(
            r#"(module
                 (func (export "proxy_on_context_create") (param i32 i32))
                 (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
                   i32.const 0)
                 (func (export "proxy_on_done") (param i32) (result i32) i32.const 0))"#,
        );

        instance
            .proxy_on_context_create(1, 0, ContextType::PluginContext)
            .unwrap();
        assert_eq!(
            instance.proxy_on_request_headers(1, 0, false).unwrap(),
            Action::Continue
        );
        assert!(!instance.proxy_on_done(1).unwrap());
    }

    #[test]
    fn test_missing_export_fails_start() {
        let mut instance = instance_for(
            r#"(module (func (export "proxy_on_context_create") (param i32 i32 i32)))"#,
        );
        instance.register_imports().unwrap();

        let err = instance.start().unwrap_err();
        assert!(matches!(err, RuntimeError::GuestLoad { .. }));
        assert!(!instance.is_running());
    }

    #[test]
    fn test_trap_keeps_instance_running() {
        let mut instance = started(GUEST);

        let err = instance.proxy_on_request_headers(1, 99, true).unwrap_err();
        assert!(err.is_trap());
        assert!(instance.is_running());
        assert!(instance.proxy_on_done(1).is_ok());
    }

    #[test]
    fn test_fuel_exhaustion_stops_instance() {
        let mut instance = started(GUEST);

        let err = instance.proxy_on_request_headers(1, 77, true).unwrap_err();
        assert!(matches!(err, RuntimeError::FuelExhausted));
        assert_eq!(instance.state(), InstanceState::Stopped);

        let err = instance.proxy_on_done(1).unwrap_err();
        assert!(err.is_unhealthy());
    }

    #[test]
    fn test_unprovided_status_imports_answer_unimplemented() {
        let mut instance = started(
            r#"(module
                 (import "env" "proxy_dispatch_http_call"
                   (func $dispatch (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
                 (func (export "proxy_on_context_create") (param i32 i32 i32))
                 (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
                   (call $dispatch (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)
                     (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)
                     (i32.const 0)))
                 (func (export "proxy_on_done") (param i32) (result i32) i32.const 1))"#,
        );

        instance
            .proxy_on_context_create(1, 0, ContextType::PluginContext)
            .unwrap();
        assert_eq!(
            instance.proxy_on_request_headers(1, 0, true).unwrap(),
            Action::Unknown(12)
        );
        assert!(instance.is_running());
    }

    #[test]
    fn test_other_unknown_imports_trap_only_when_called() {
        let mut instance = started(
            r#"(module
                 (import "env" "proxy_abort" (func $abort))
                 (import "vendor" "status" (func $status (result i32)))
                 (func (export "proxy_on_context_create") (param i32 i32 i32))
                 (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
                   (if (local.get 1) (then (call $abort)))
                   (call $status))
                 (func (export "proxy_on_done") (param i32) (result i32) i32.const 1))"#,
        );

        instance
            .proxy_on_context_create(1, 0, ContextType::PluginContext)
            .unwrap();
        assert!(instance.proxy_on_request_headers(1, 1, true).unwrap_err().is_trap());
        assert!(instance.proxy_on_request_headers(1, 0, true).unwrap_err().is_trap());
        assert!(instance.is_running());
    }

    struct Quiet;

    impl ImportsHandler for Quiet {
        fn log(&mut self, _level: LogLevel, _message: &str) -> HostResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stop_reinstalls_default_handler() {
        let mut instance = started(GUEST);
        instance.set_handler(Box::new(Quiet));

        instance.stop();
        let mut previous = instance.set_handler(Box::new(DefaultImportsHandler));
        assert!(previous.log(LogLevel::Info, "x").unwrap_err().is_unimplemented());
    }
}
