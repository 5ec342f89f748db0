//! Host capability implementations for proxywasm-bridge.
//!
//! This crate provides the concrete handlers a unit of work installs on the
//! shared guest. Each request gets its own handler; the guest sees only
//! the data of the request currently owning it.
//!
//! # Modules
//!
//! - [`logging`]: Guest log capture into a per-request sink
//! - [`header`]: Owned, mutable header collection
//! - [`handler`]: Per-request HTTP capability handler
//! - [`loader`]: Plugin construction on wasmtime

pub mod handler;
pub mod header;
pub mod loader;
pub mod logging;

pub use handler::HttpRequestHandler;
pub use header::HeaderPairs;
pub use loader::{load_plugin, load_plugin_file, load_plugin_wat};
pub use logging::{LogEntry, LogSink, LoggingHost};
