//! HTTP responses for units of work.
//!
//! This module provides [`BridgeResponse`] and the JSON shapes reported to
//! the client: the guest's disposition and the logs it emitted.

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use serde::Serialize;

use proxywasm_bridge_host::LogEntry;

/// A guest log line as reported to the client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogLine {
    /// Log level name.
    pub level: String,
    /// Log message.
    pub message: String,
}

impl From<&LogEntry> for LogLine {
    fn from(entry: &LogEntry) -> Self {
        Self {
            level: entry.level.to_string(),
            message: entry.message.clone(),
        }
    }
}

/// Convert log entries to their reported form.
pub fn log_lines(entries: &[LogEntry]) -> Vec<LogLine> {
    entries.iter().map(LogLine::from).collect()
}

/// Response body for a unit of work the guest completed.
#[derive(Debug, Clone, Serialize)]
pub struct RequestReport {
    /// Identifier of the HTTP request.
    pub request_id: String,
    /// Leaf context the guest served it in.
    pub context_id: i32,
    /// Disposition from `proxy_on_request_headers`.
    pub action: String,
    /// Whether teardown completed immediately.
    pub done: bool,
    /// Logs the guest emitted.
    pub logs: Vec<LogLine>,
}

/// Error detail for a failed unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    /// Failure class: `trap`, `unavailable` or `internal`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Trap code if the guest trapped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Leaf context the failure belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i32>,
}

/// Response body for a failed unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Identifier of the HTTP request.
    pub request_id: String,
    /// What went wrong.
    pub error: ErrorDetail,
    /// Logs the guest emitted before failing.
    pub logs: Vec<LogLine>,
}

/// Status and body of a driver response.
#[derive(Debug, Clone)]
pub struct BridgeResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// JSON body
    pub body: Vec<u8>,
}

impl BridgeResponse {
    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to encode response: {e}"),
            ),
        }
    }

    /// Create an error response with JSON body.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let body = serde_json::json!({
            "error": message
        })
        .to_string();
        Self {
            status,
            body: body.into_bytes(),
        }
    }

    /// Convert to Axum response.
    pub fn into_axum_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
