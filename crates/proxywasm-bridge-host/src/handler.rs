//! Per-request capability handler.

use proxywasm_bridge_core::{ContextId, HeaderMap, HostResult, ImportsHandler, LogLevel};

use crate::logging::{LogSink, LoggingHost};

/// Capabilities for one HTTP request: its headers and a log sink.
///
/// Everything not overridden here answers the guest with
/// `WasmResult::Unimplemented`.
pub struct HttpRequestHandler<H> {
    headers: H,
    logs: LogSink,
    log_level: LogLevel,
    effective_context: Option<ContextId>,
}

impl<H: HeaderMap> HttpRequestHandler<H> {
    /// Serve `headers` to the guest and collect its logs into `logs`.
    pub fn new(headers: H, logs: LogSink) -> Self {
        Self {
            headers,
            logs,
            log_level: LogLevel::Trace,
            effective_context: None,
        }
    }

    /// Drop guest logs below `level`.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Context the guest last made effective.
    pub fn effective_context(&self) -> Option<ContextId> {
        self.effective_context
    }
}

impl<H: HeaderMap> ImportsHandler for HttpRequestHandler<H> {
    fn log(&mut self, level: LogLevel, message: &str) -> HostResult<()> {
        if level >= self.log_level {
            LoggingHost::log(&self.logs, self.effective_context, level, message);
        }
        Ok(())
    }

    fn log_level(&self) -> HostResult<LogLevel> {
        Ok(self.log_level)
    }

    fn http_request_headers(&mut self) -> Option<&mut dyn HeaderMap> {
        Some(&mut self.headers)
    }

    fn set_effective_context(&mut self, context_id: ContextId) -> HostResult<()> {
        self.effective_context = Some(context_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeaderPairs;
    use proxywasm_bridge_core::MapType;

    fn handler() -> (HttpRequestHandler<HeaderPairs>, LogSink) {
        let logs = LogSink::new();
        let headers: HeaderPairs = [("a", "1")].into_iter().collect();
        (HttpRequestHandler::new(headers, logs.clone()), logs)
    }

    #[test]
    fn test_serves_request_headers() {
        let (mut handler, _) = handler();

        let map = handler.header_map(MapType::HttpRequestHeaders).unwrap();
        assert_eq!(map.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_other_maps_unimplemented() {
        let (mut handler, _) = handler();

        for map_type in [
            MapType::HttpRequestTrailers,
            MapType::HttpResponseHeaders,
            MapType::HttpResponseTrailers,
        ] {
            assert!(handler.header_map(map_type).err().unwrap().is_unimplemented());
        }
        assert!(handler.get_property(&[]).unwrap_err().is_unimplemented());
        assert!(handler.done().unwrap_err().is_unimplemented());
    }

    #[test]
    fn test_logs_reach_sink() {
        let (mut handler, logs) = handler();

        handler.set_effective_context(4).unwrap();
        handler.log(LogLevel::Info, "seen").unwrap();

        assert_eq!(handler.effective_context(), Some(4));
        assert_eq!(logs.messages(), vec!["seen"]);
    }

    #[test]
    fn test_log_level_filters() {
        let (handler, logs) = handler();
        let mut handler = handler.with_log_level(LogLevel::Warn);

        assert_eq!(handler.log_level().unwrap(), LogLevel::Warn);
        handler.log(LogLevel::Info, "dropped").unwrap();
        handler.log(LogLevel::Error, "kept").unwrap();

        assert_eq!(logs.messages(), vec!["kept"]);
    }
}
