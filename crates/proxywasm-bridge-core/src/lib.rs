//! Core proxy-wasm host runtime for proxywasm-bridge.
//!
//! This crate drives a single proxy-wasm guest:
//! - [`WasmEngine`]: Configured Wasmtime engine with fuel metering
//! - [`CompiledModule`]: Compiled guest module wrapper
//! - [`WasmtimeInstance`]: The guest, behind the [`GuestInstance`] boundary
//! - [`AbiContext`]: Ordered access to the guest's exports
//! - [`WasmPlugin`]: Exclusive ownership and the root/leaf context protocol
//! - [`ImportsHandler`] and [`HeaderMap`]: Per-request host capabilities
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      WasmPlugin                         │
//! │  (Shared across all requests, thread-safe)              │
//! │  - ContextIdGenerator                                   │
//! │  - Root context gate                                    │
//! │  - Ownership lock (optional timeout)                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              AbiContext<WasmtimeInstance>               │
//! │  (One owner at a time)                                  │
//! │  - Import registration order                            │
//! │  - proxy_on_* export calls                              │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                Store<HostState> + Instance              │
//! │  (Long-lived, one per process)                          │
//! │  - Installed ImportsHandler (swapped per request)       │
//! │  - Fuel refilled per export call                        │
//! │  - Linear memory                                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod context;
pub mod context_id;
pub mod engine;
pub mod handler;
pub mod header;
pub mod instance;
pub mod linker;
pub mod module;
pub mod plugin;
pub mod store;

pub use abi::{Action, ContextId, ContextType, LogLevel, MapType, WasmResult};
pub use context::AbiContext;
pub use context_id::ContextIdGenerator;
pub use engine::WasmEngine;
pub use handler::{DefaultImportsHandler, HostResult, ImportsHandler};
pub use header::HeaderMap;
pub use instance::{GuestInstance, InstanceState, WasmtimeInstance};
pub use module::CompiledModule;
pub use plugin::{PluginGuard, ProtocolError, RequestError, RequestOutcome, WasmPlugin};
pub use store::HostState;
