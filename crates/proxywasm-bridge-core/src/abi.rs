//! Proxy-wasm ABI primitives.
//!
//! Integer encodings shared by the guest exports and the host imports.

use std::fmt;

use proxywasm_bridge_common::HostFunctionError;

/// Identifier of a guest-side context.
///
/// `0` is reserved for "no parent" and "no plugin configuration".
pub type ContextId = i32;

/// Parent id passed when creating the root context.
pub const NO_PARENT: ContextId = 0;

/// Kind of context passed to `proxy_on_context_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ContextType {
    /// VM-wide context.
    VmContext = 1,
    /// Root context of a plugin; lives as long as the instance.
    PluginContext = 2,
    /// Per-connection stream context.
    StreamContext = 3,
    /// Per-request HTTP context.
    HttpContext = 4,
}

impl ContextType {
    /// Raw value passed to the guest.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Disposition returned by processing exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Continue processing the stream.
    Continue,
    /// Pause processing until the guest resumes it.
    Pause,
    /// A value outside the known set, kept verbatim.
    Unknown(i32),
}

impl Action {
    /// Decode the raw value returned by the guest.
    pub fn from_i32(raw: i32) -> Self {
        match raw {
            0 => Self::Continue,
            1 => Self::Pause,
            other => Self::Unknown(other),
        }
    }

    /// Raw value as seen by the guest.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Continue => 0,
            Self::Pause => 1,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Pause => write!(f, "pause"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// Status codes returned from host imports to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WasmResult {
    Ok = 0,
    NotFound = 1,
    BadArgument = 2,
    SerializationFailure = 3,
    ParseFailure = 4,
    InvalidMemoryAccess = 6,
    Empty = 7,
    InternalFailure = 10,
    Unimplemented = 12,
}

impl WasmResult {
    /// Raw value handed back to the guest.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<&HostFunctionError> for WasmResult {
    fn from(err: &HostFunctionError) -> Self {
        match err {
            // A read-only adapter declining a mutation looks the same to the
            // guest as a handler without the capability.
            HostFunctionError::Unimplemented { .. } | HostFunctionError::Unsupported { .. } => {
                Self::Unimplemented
            }
            HostFunctionError::NotFound { .. } => Self::NotFound,
            HostFunctionError::InvalidArgument { .. } => Self::BadArgument,
            HostFunctionError::InvalidMemoryAccess { .. } => Self::InvalidMemoryAccess,
            HostFunctionError::Internal { .. } => Self::InternalFailure,
        }
    }
}

/// Collapse a capability result into the code returned to the guest.
pub fn status_of<T>(result: &Result<T, HostFunctionError>) -> WasmResult {
    match result {
        Ok(_) => WasmResult::Ok,
        Err(err) => err.into(),
    }
}

/// Log level used by `proxy_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Decode the raw level passed by the guest.
    ///
    /// Unknown values default to `Info`.
    pub fn from_i32(level: i32) -> Self {
        match level {
            0 => Self::Trace,
            1 => Self::Debug,
            3 => Self::Warn,
            4 => Self::Error,
            5 => Self::Critical,
            _ => Self::Info,
        }
    }

    /// Raw value as seen by the guest.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Critical => 5,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "TRACE"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Header collection addressed by the header-map imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    HttpRequestHeaders,
    HttpRequestTrailers,
    HttpResponseHeaders,
    HttpResponseTrailers,
}

impl MapType {
    /// Decode the raw map type, `None` for anything outside the HTTP maps.
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::HttpRequestHeaders),
            1 => Some(Self::HttpRequestTrailers),
            2 => Some(Self::HttpResponseHeaders),
            3 => Some(Self::HttpResponseTrailers),
            _ => None,
        }
    }
}

/// Serialize header pairs into the proxy-wasm map layout.
///
/// Layout: pair count, then `(key_len, value_len)` for every pair, then
/// every key and value followed by a NUL byte. Integers are little-endian `u32`.
#[allow(clippy::cast_possible_truncation)]
pub fn serialize_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let size = 4
        + pairs
            .iter()
            .map(|(k, v)| 8 + k.len() + v.len() + 2)
            .sum::<usize>();
    let mut buf = Vec::with_capacity(size);

    buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (key, value) in pairs {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    }
    for (key, value) in pairs {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }

    buf
}

/// Parse the proxy-wasm map layout back into pairs.
///
/// Returns `None` if the buffer is truncated or not UTF-8.
pub fn deserialize_pairs(buf: &[u8]) -> Option<Vec<(String, String)>> {
    let read_u32 = |at: usize| -> Option<usize> {
        let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes) as usize)
    };

    let count = read_u32(0)?;
    let mut sizes = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        let at = 4 + i * 8;
        sizes.push((read_u32(at)?, read_u32(at + 4)?));
    }

    let mut offset = 4 + count * 8;
    let mut pairs = Vec::with_capacity(sizes.len());
    for (key_len, value_len) in sizes {
        let key = buf.get(offset..offset + key_len)?;
        offset += key_len + 1;
        let value = buf.get(offset..offset + value_len)?;
        offset += value_len + 1;
        pairs.push((
            String::from_utf8(key.to_vec()).ok()?,
            String::from_utf8(value.to_vec()).ok()?,
        ));
    }

    Some(pairs)
}
