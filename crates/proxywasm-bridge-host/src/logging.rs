//! Guest log capture.
//!
//! Guest log lines are both:
//! 1. Stored in a [`LogSink`] owned by the unit of work that produced them
//! 2. Emitted via the `tracing` crate for observability

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use proxywasm_bridge_core::{ContextId, LogLevel};
use tracing::{debug, error, info, trace, warn};

/// A log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// When the log was emitted.
    pub timestamp: Instant,
}

/// Shared collection of captured guest logs.
///
/// Clones share the same entries: a handler holds one clone while the
/// request driver keeps another to read the logs after the unit of work.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, level: LogLevel, message: &str) {
        self.entries.lock().push(LogEntry {
            level,
            message: message.to_string(),
            timestamp: Instant::now(),
        });
    }

    /// Snapshot of all entries in emission order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Messages only, in emission order.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Remove and return all entries.
    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Host side of `proxy_log`.
pub struct LoggingHost;

impl LoggingHost {
    /// Record a guest log line and emit it through `tracing`.
    ///
    /// # Arguments
    ///
    /// * `sink` - Where the unit of work collects its logs
    /// * `context_id` - Effective context, if the guest set one
    /// * `level` - The log level
    /// * `message` - The log message
    pub fn log(sink: &LogSink, context_id: Option<ContextId>, level: LogLevel, message: &str) {
        sink.push(level, message);

        match level {
            LogLevel::Trace => trace!(?context_id, guest_log = true, "{}", message),
            LogLevel::Debug => debug!(?context_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(?context_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(?context_id, guest_log = true, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                error!(?context_id, guest_log = true, level = %level, "{}", message);
            }
        }
    }
}
