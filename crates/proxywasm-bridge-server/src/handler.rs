//! Request handlers driving the guest.
//!
//! Every inbound request outside the reserved routes is one unit of work:
//! its headers are handed to the shared guest through a fresh
//! [`HttpRequestHandler`], and the guest's disposition and logs are
//! reported back as JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{Span, error, info, instrument};
use uuid::Uuid;

use proxywasm_bridge_common::RuntimeError;
use proxywasm_bridge_core::RequestError;
use proxywasm_bridge_host::{HttpRequestHandler, LogSink};

use crate::request::RequestHeaderMap;
use crate::response::{BridgeResponse, ErrorDetail, ErrorReport, LogLine, RequestReport, log_lines};
use crate::state::AppState;

/// Run the guest for an HTTP request.
///
/// This handler:
/// 1. Wraps the request headers for the guest
/// 2. Runs the unit of work on the blocking pool
/// 3. Returns the guest's disposition and logs as JSON
#[instrument(skip_all, fields(request_id, method = %request.method(), uri = %request.uri()))]
pub async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    Span::current().record("request_id", request_id.as_str());

    let (parts, _body) = request.into_parts();
    let headers = RequestHeaderMap::new(parts.headers);
    let header_count = u32::try_from(headers.count()).unwrap_or(u32::MAX);
    let end_of_stream = headers.end_of_stream();

    let logs = LogSink::new();
    let handler =
        HttpRequestHandler::new(headers, logs.clone()).with_log_level(state.guest_log_level());
    let plugin = Arc::clone(state.plugin());

    let result = tokio::task::spawn_blocking(move || {
        plugin.on_http_request(Box::new(handler), header_count, end_of_stream)
    })
    .await;

    let logs = log_lines(&logs.take());

    let response = match result {
        Ok(Ok(outcome)) => {
            info!(
                context_id = outcome.context_id,
                action = %outcome.action,
                duration_ms = start.elapsed().as_millis(),
                log_count = logs.len(),
                "Request completed"
            );
            BridgeResponse::json(
                StatusCode::OK,
                &RequestReport {
                    request_id,
                    context_id: outcome.context_id,
                    action: outcome.action.to_string(),
                    done: outcome.done,
                    logs,
                },
            )
        }
        Ok(Err(err)) => {
            error!(
                error = %err,
                duration_ms = start.elapsed().as_millis(),
                "Request failed"
            );
            error_to_response(request_id, &err, logs)
        }
        Err(join_err) => {
            error!(error = %join_err, "Request task failed");
            BridgeResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    };

    response.into_axum_response()
}

/// Convert a failed unit of work to an HTTP response.
fn error_to_response(request_id: String, err: &RequestError, logs: Vec<LogLine>) -> BridgeResponse {
    let (status, kind) = if err.is_unhealthy() || err.is_lock_timeout() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else if matches!(err, RequestError::Protocol(_))
        || err.runtime().is_some_and(RuntimeError::is_trap)
    {
        (StatusCode::INTERNAL_SERVER_ERROR, "trap")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
    };

    let code = match err.runtime() {
        Some(RuntimeError::GuestTrap { code, .. }) => code.clone(),
        _ => None,
    };
    let context_id = match err {
        RequestError::Protocol(protocol) => Some(protocol.context_id),
        RequestError::Runtime(_) => None,
    };

    BridgeResponse::json(
        status,
        &ErrorReport {
            request_id,
            error: ErrorDetail {
                kind,
                message: err.to_string(),
                code,
                context_id,
            },
            logs,
        },
    )
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK while the guest accepts requests, 503 once it stopped.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let plugin = Arc::clone(state.plugin());
    let running = tokio::task::spawn_blocking(move || plugin.is_running())
        .await
        .unwrap_or(false);

    let plugin = state.plugin();
    let body = serde_json::json!({
        "status": if running { "ready" } else { "unavailable" },
        "root_id": plugin.root_id(),
        "root_created": plugin.root_created(),
    });
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(body))
}
