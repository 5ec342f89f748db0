//! Inbound request headers exposed to the guest.
//!
//! This module provides [`RequestHeaderMap`], a read-only
//! [`HeaderMap`](proxywasm_bridge_core::HeaderMap) over the headers of the
//! HTTP request being served.

use axum::http::{self, header};

use proxywasm_bridge_core::HeaderMap;

/// Read-only view of an inbound request's headers.
///
/// `get` returns the first value for a name; `range` visits every value in
/// the order the request carried them. Mutations are declined.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaderMap {
    headers: http::HeaderMap,
}

impl RequestHeaderMap {
    /// Wrap the request's headers.
    pub fn new(headers: http::HeaderMap) -> Self {
        Self { headers }
    }

    /// Number of header values, counting repeated names.
    pub fn count(&self) -> usize {
        self.headers.len()
    }

    /// Whether the request announces no body.
    pub fn end_of_stream(&self) -> bool {
        if self.headers.contains_key(header::TRANSFER_ENCODING) {
            return false;
        }
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_none_or(|len| len == 0)
    }
}

impl From<http::HeaderMap> for RequestHeaderMap {
    fn from(headers: http::HeaderMap) -> Self {
        Self::new(headers)
    }
}

impl HeaderMap for RequestHeaderMap {
    fn get(&self, key: &str) -> Option<String> {
        self.headers
            .get(key)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes());
            if !visit(name.as_str(), &value) {
                break;
            }
        }
    }
}
