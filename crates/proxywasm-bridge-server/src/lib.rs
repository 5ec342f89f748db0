//! HTTP front for proxywasm-bridge.
//!
//! This crate drives the shared proxy-wasm guest from inbound HTTP requests.
//! It handles:
//!
//! - Request routing, with `/health` and `/ready` reserved
//! - Adapting request headers to the guest's header capability
//! - Reporting the guest's disposition and logs as JSON
//!
//! # Quick Start
//!
//! ```ignore
//! use proxywasm_bridge_common::RuntimeConfig;
//! use proxywasm_bridge_server::{AppState, BridgeServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::from_file(&RuntimeConfig::default(), "./guest.wasm")?;
//!     let server = BridgeServer::new(state, ServerConfig::default());
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use request::RequestHeaderMap;
pub use server::{BridgeServer, ServerConfig, TestHandle};
pub use state::AppState;
