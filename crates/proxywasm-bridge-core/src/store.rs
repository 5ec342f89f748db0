//! Store data shared between the guest instance and host imports.
//!
//! This module provides:
//! - [`HostState`]: Data of the wasmtime store, reachable from every import
//! - [`create_store`]: Store construction with memory limits

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use crate::handler::{DefaultImportsHandler, ImportsHandler};
use proxywasm_bridge_common::ExecutionConfig;

/// Data attached to the guest's store.
///
/// Host imports reach the installed capability handler through
/// [`wasmtime::Caller::data_mut`]. The handler is replaced per unit of work;
/// nothing else in here carries request state.
pub struct HostState {
    /// Installed capability handler.
    handler: Box<dyn ImportsHandler>,

    /// WASI preview1 context for guests built against wasi.
    pub(crate) wasi: WasiP1Ctx,

    /// Memory limits enforced on the guest.
    pub(crate) limits: StoreLimits,
}

impl HostState {
    /// Create store data with the default handler installed.
    pub fn new(config: &ExecutionConfig) -> Self {
        let mut builder = WasiCtxBuilder::new();
        if config.inherit_stdio {
            builder.inherit_stdout().inherit_stderr();
        }

        Self {
            handler: Box::new(DefaultImportsHandler),
            wasi: builder.build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(config.max_memory_bytes())
                .build(),
        }
    }

    /// Install `handler`, returning the previous one.
    pub fn set_handler(&mut self, handler: Box<dyn ImportsHandler>) -> Box<dyn ImportsHandler> {
        std::mem::replace(&mut self.handler, handler)
    }

    /// Access the installed handler.
    pub fn handler_mut(&mut self) -> &mut dyn ImportsHandler {
        self.handler.as_mut()
    }
}

/// Create a new wasmtime store for the guest.
///
/// # Arguments
///
/// * `engine` - The shared engine
/// * `config` - Execution configuration (memory limits, stdio)
pub fn create_store(engine: &WasmEngine, config: &ExecutionConfig) -> Store<HostState> {
    let mut store = Store::new(engine.inner(), HostState::new(config));
    store.limiter(|state| &mut state.limits);
    store
}
