//! Capability handler contract.
//!
//! The guest reaches host capabilities only through the handler currently
//! installed on its [`AbiContext`](crate::AbiContext). Handlers are swapped
//! per unit of work, so each request sees its own host-side data while the
//! guest instance is shared.
//!
//! Every capability has a default answer of
//! [`HostFunctionError::Unimplemented`]; concrete handlers override the
//! subset they support. The linker turns that answer into
//! [`WasmResult::Unimplemented`](crate::abi::WasmResult::Unimplemented)
//! for the guest.

use std::time::{SystemTime, UNIX_EPOCH};

use proxywasm_bridge_common::HostFunctionError;

use crate::abi::{ContextId, LogLevel, MapType};
use crate::header::HeaderMap;

/// Result of a capability call.
pub type HostResult<T> = Result<T, HostFunctionError>;

/// Host-side capabilities invoked by guest imports.
pub trait ImportsHandler: Send {
    /// Emit a guest log line.
    fn log(&mut self, _level: LogLevel, _message: &str) -> HostResult<()> {
        Err(HostFunctionError::unimplemented("log"))
    }

    /// Minimum level the guest should bother emitting.
    fn log_level(&self) -> HostResult<LogLevel> {
        Err(HostFunctionError::unimplemented("log_level"))
    }

    /// Headers of the inbound request.
    fn http_request_headers(&mut self) -> Option<&mut dyn HeaderMap> {
        None
    }

    /// Trailers of the inbound request.
    fn http_request_trailers(&mut self) -> Option<&mut dyn HeaderMap> {
        None
    }

    /// Headers of the outbound response.
    fn http_response_headers(&mut self) -> Option<&mut dyn HeaderMap> {
        None
    }

    /// Trailers of the outbound response.
    fn http_response_trailers(&mut self) -> Option<&mut dyn HeaderMap> {
        None
    }

    /// Resolve a map type to the matching header collection.
    fn header_map(&mut self, map_type: MapType) -> HostResult<&mut dyn HeaderMap> {
        let (map, capability) = match map_type {
            MapType::HttpRequestHeaders => (self.http_request_headers(), "http_request_headers"),
            MapType::HttpRequestTrailers => {
                (self.http_request_trailers(), "http_request_trailers")
            }
            MapType::HttpResponseHeaders => {
                (self.http_response_headers(), "http_response_headers")
            }
            MapType::HttpResponseTrailers => {
                (self.http_response_trailers(), "http_response_trailers")
            }
        };
        map.ok_or(HostFunctionError::unimplemented(capability))
    }

    /// Wall-clock time in nanoseconds since the Unix epoch.
    fn current_time_nanos(&self) -> HostResult<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| HostFunctionError::Internal {
                reason: e.to_string(),
            })?;
        u64::try_from(now.as_nanos()).map_err(|e| HostFunctionError::Internal {
            reason: e.to_string(),
        })
    }

    /// Read a host property addressed by path segments.
    fn get_property(&self, _path: &[String]) -> HostResult<Vec<u8>> {
        Err(HostFunctionError::unimplemented("get_property"))
    }

    /// Write a host property addressed by path segments.
    fn set_property(&mut self, _path: &[String], _value: &[u8]) -> HostResult<()> {
        Err(HostFunctionError::unimplemented("set_property"))
    }

    /// Short-circuit the request with a locally generated response.
    fn send_local_response(
        &mut self,
        _status: u32,
        _details: &str,
        _body: &[u8],
        _headers: Vec<(String, String)>,
    ) -> HostResult<()> {
        Err(HostFunctionError::unimplemented("send_local_response"))
    }

    /// Switch the context subsequent calls apply to.
    fn set_effective_context(&mut self, _context_id: ContextId) -> HostResult<()> {
        Err(HostFunctionError::unimplemented("set_effective_context"))
    }

    /// Guest signals it finished a deferred teardown.
    fn done(&mut self) -> HostResult<()> {
        Err(HostFunctionError::unimplemented("done"))
    }
}

/// Handler that overrides nothing.
///
/// Installed whenever no unit of work owns the guest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImportsHandler;

impl ImportsHandler for DefaultImportsHandler {}
