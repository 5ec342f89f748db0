//! Lifecycle and concurrency tests for `WasmPlugin`.
//!
//! These tests drive the plugin against a scripted guest that records every
//! export call, so they can verify:
//! - Context id uniqueness under concurrency
//! - Exactly-once root creation
//! - Mutual exclusion across create, process and teardown
//! - Teardown after processing failures
//! - Lock timeouts and stopped guests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proxywasm_bridge_common::{PluginConfig, RuntimeError};
use proxywasm_bridge_core::{
    Action, ContextId, ContextIdGenerator, ContextType, DefaultImportsHandler, GuestInstance,
    ImportsHandler, LogLevel, RequestError, WasmPlugin,
};
use proxywasm_bridge_host::{HeaderPairs, HttpRequestHandler, LogSink};

// ============================================================================
// Scripted guest
// ============================================================================

#[derive(Default)]
struct GuestLog {
    in_export: AtomicBool,
    overlapping_calls: AtomicUsize,
    interleavings: AtomicUsize,
    owner: Mutex<Option<ContextId>>,
    roots_created: AtomicUsize,
    fail_root_once: AtomicBool,
    fail_create: AtomicBool,
    fail_headers: AtomicBool,
    fail_done: AtomicBool,
    created: Mutex<Vec<(ContextId, ContextId, ContextType)>>,
    done: Mutex<Vec<ContextId>>,
    handler_installed: Mutex<Vec<(&'static str, bool)>>,
    request_handler_installed: AtomicBool,
}

struct ScriptedGuest {
    record: Arc<GuestLog>,
    handler: Box<dyn ImportsHandler>,
    running: bool,
}

impl ScriptedGuest {
    fn new(record: Arc<GuestLog>) -> Self {
        Self {
            record,
            handler: Box::new(DefaultImportsHandler),
            running: false,
        }
    }

    fn enter(&mut self, export: &'static str) {
        if self.record.in_export.swap(true, Ordering::SeqCst) {
            self.record.overlapping_calls.fetch_add(1, Ordering::SeqCst);
        }
        // Request handlers answer log_level; the default handler does not.
        let installed = self.handler.log_level().is_ok();
        self.record.handler_installed.lock().push((export, installed));
        thread::sleep(Duration::from_micros(50));
    }

    fn exit(&self) {
        self.record.in_export.store(false, Ordering::SeqCst);
    }
}

impl GuestInstance for ScriptedGuest {
    fn register_imports(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), RuntimeError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_handler(&mut self, handler: Box<dyn ImportsHandler>) -> Box<dyn ImportsHandler> {
        self.record
            .request_handler_installed
            .store(handler.log_level().is_ok(), Ordering::SeqCst);
        std::mem::replace(&mut self.handler, handler)
    }

    fn proxy_on_context_create(
        &mut self,
        context_id: ContextId,
        parent_id: ContextId,
        kind: ContextType,
    ) -> Result<(), RuntimeError> {
        if !self.running {
            return Err(RuntimeError::unhealthy("stopped"));
        }
        self.enter("create");
        let result = if kind == ContextType::PluginContext {
            if self.record.fail_root_once.swap(false, Ordering::SeqCst) {
                Err(RuntimeError::trap("root create failed"))
            } else {
                self.record.roots_created.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        } else if self.record.fail_create.load(Ordering::SeqCst) {
            Err(RuntimeError::trap("leaf create failed"))
        } else {
            let mut owner = self.record.owner.lock();
            if owner.is_some() {
                self.record.interleavings.fetch_add(1, Ordering::SeqCst);
            }
            *owner = Some(context_id);
            Ok(())
        };
        if result.is_ok() {
            self.record.created.lock().push((context_id, parent_id, kind));
        }
        self.exit();
        result
    }

    fn proxy_on_request_headers(
        &mut self,
        context_id: ContextId,
        _header_count: u32,
        _end_of_stream: bool,
    ) -> Result<Action, RuntimeError> {
        self.enter("headers");
        if *self.record.owner.lock() != Some(context_id) {
            self.record.interleavings.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self
            .handler
            .log(LogLevel::Info, &format!("headers for {context_id}"));
        self.exit();

        if self.record.fail_headers.load(Ordering::SeqCst) {
            return Err(RuntimeError::trap("unreachable"));
        }
        Ok(Action::Continue)
    }

    fn proxy_on_done(&mut self, context_id: ContextId) -> Result<bool, RuntimeError> {
        self.enter("done");
        {
            let mut owner = self.record.owner.lock();
            if *owner != Some(context_id) {
                self.record.interleavings.fetch_add(1, Ordering::SeqCst);
            }
            *owner = None;
        }
        self.record.done.lock().push(context_id);
        self.exit();

        if self.record.fail_done.load(Ordering::SeqCst) {
            return Err(RuntimeError::trap("done failed"));
        }
        Ok(true)
    }
}

fn plugin_with(config: &PluginConfig) -> (WasmPlugin<ScriptedGuest>, Arc<GuestLog>) {
    let record = Arc::new(GuestLog::default());
    let plugin = WasmPlugin::new(ScriptedGuest::new(Arc::clone(&record)), config).unwrap();
    (plugin, record)
}

fn plugin() -> (WasmPlugin<ScriptedGuest>, Arc<GuestLog>) {
    plugin_with(&PluginConfig::default())
}

fn request(logs: &LogSink) -> Box<dyn ImportsHandler> {
    let headers: HeaderPairs = [("a", "1")].into_iter().collect();
    Box::new(HttpRequestHandler::new(headers, logs.clone()))
}

// ============================================================================
// Test: Ids and exclusivity
// ============================================================================

#[test]
fn test_concurrent_units_get_distinct_ids_and_never_interleave() {
    let (plugin, record) = plugin();
    let plugin = Arc::new(plugin);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let plugin = Arc::clone(&plugin);
            thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        let logs = LogSink::new();
                        let outcome = plugin.on_http_request(request(&logs), 1, true).unwrap();
                        assert_eq!(
                            logs.messages(),
                            vec![format!("headers for {}", outcome.context_id)]
                        );
                        outcome.context_id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert_ne!(id, plugin.root_id());
            assert!(ids.insert(id), "duplicate context id {id}");
        }
    }

    assert_eq!(ids.len(), 200);
    assert_eq!(record.overlapping_calls.load(Ordering::SeqCst), 0);
    assert_eq!(record.interleavings.load(Ordering::SeqCst), 0);
    assert_eq!(record.roots_created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_leaf_contexts_are_children_of_root() {
    let (plugin, record) = plugin();
    let outcome = plugin
        .on_http_request(request(&LogSink::new()), 1, false)
        .unwrap();

    let created = record.created.lock().clone();
    assert_eq!(
        created,
        vec![
            (plugin.root_id(), 0, ContextType::PluginContext),
            (outcome.context_id, plugin.root_id(), ContextType::HttpContext),
        ]
    );
    assert_eq!(outcome.action, Action::Continue);
    assert!(outcome.done);
}

#[test]
fn test_shared_generator_spans_plugins() {
    let ids = Arc::new(ContextIdGenerator::new());
    let config = PluginConfig::default();

    let first = WasmPlugin::with_ids(
        ScriptedGuest::new(Arc::default()),
        &config,
        Arc::clone(&ids),
    )
    .unwrap();
    let second = WasmPlugin::with_ids(
        ScriptedGuest::new(Arc::default()),
        &config,
        Arc::clone(&ids),
    )
    .unwrap();

    assert_ne!(first.root_id(), second.root_id());
    let a = first.on_http_request(request(&LogSink::new()), 0, true).unwrap();
    let b = second.on_http_request(request(&LogSink::new()), 0, true).unwrap();
    assert_ne!(a.context_id, b.context_id);
}

// ============================================================================
// Test: Root creation
// ============================================================================

#[test]
fn test_root_created_exactly_once() {
    for workers in [1, 2, 10, 100] {
        let (plugin, record) = plugin();
        let barrier = Barrier::new(workers);

        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    barrier.wait();
                    plugin
                        .on_http_request(request(&LogSink::new()), 0, true)
                        .unwrap();
                });
            }
        });

        assert!(plugin.root_created());
        assert_eq!(record.roots_created.load(Ordering::SeqCst), 1, "workers={workers}");
        assert_eq!(record.done.lock().len(), workers);
    }
}

#[test]
fn test_failed_root_is_retried_by_next_unit() {
    let (plugin, record) = plugin();
    record.fail_root_once.store(true, Ordering::SeqCst);

    let err = plugin
        .on_http_request(request(&LogSink::new()), 0, true)
        .unwrap_err();
    assert!(matches!(err, RequestError::Runtime(RuntimeError::GuestTrap { .. })));
    assert!(!plugin.root_created());
    assert!(record.done.lock().is_empty());

    plugin
        .on_http_request(request(&LogSink::new()), 0, true)
        .unwrap();
    assert!(plugin.root_created());
    assert_eq!(record.roots_created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_root_created_with_default_handler() {
    let (plugin, record) = plugin();
    plugin
        .on_http_request(request(&LogSink::new()), 0, true)
        .unwrap();

    let seen = record.handler_installed.lock().clone();
    assert_eq!(
        seen,
        vec![
            ("create", false),
            ("create", true),
            ("headers", true),
            ("done", true),
        ]
    );
}

// ============================================================================
// Test: Failure handling
// ============================================================================

#[test]
fn test_done_runs_after_processing_failure() {
    let (plugin, record) = plugin();
    record.fail_headers.store(true, Ordering::SeqCst);

    let err = plugin
        .on_http_request(request(&LogSink::new()), 2, true)
        .unwrap_err();

    let RequestError::Protocol(err) = err else {
        panic!("expected protocol error, got {err:?}");
    };
    assert!(err.processing.as_ref().unwrap().is_trap());
    assert!(err.teardown.is_none());
    assert_eq!(*record.done.lock(), vec![err.context_id]);
}

#[test]
fn test_processing_and_teardown_failures_reported_independently() {
    let (plugin, record) = plugin();
    record.fail_headers.store(true, Ordering::SeqCst);
    record.fail_done.store(true, Ordering::SeqCst);

    let Err(RequestError::Protocol(err)) =
        plugin.on_http_request(request(&LogSink::new()), 0, true)
    else {
        panic!("expected protocol error");
    };
    assert!(err.processing.is_some());
    assert!(err.teardown.is_some());
    assert!(err.action.is_none());
}

#[test]
fn test_teardown_failure_keeps_action() {
    let (plugin, record) = plugin();
    record.fail_done.store(true, Ordering::SeqCst);

    let Err(RequestError::Protocol(err)) =
        plugin.on_http_request(request(&LogSink::new()), 0, true)
    else {
        panic!("expected protocol error");
    };
    assert!(err.processing.is_none());
    assert_eq!(err.action, Some(Action::Continue));
    assert!(err.teardown.is_some());
}

#[test]
fn test_create_failure_skips_done() {
    let (plugin, record) = plugin();
    record.fail_create.store(true, Ordering::SeqCst);

    let err = plugin
        .on_http_request(request(&LogSink::new()), 0, true)
        .unwrap_err();
    assert!(matches!(err, RequestError::Protocol(_)));
    assert!(record.done.lock().is_empty());

    // The failed unit released the guest.
    record.fail_create.store(false, Ordering::SeqCst);
    assert!(plugin.on_http_request(request(&LogSink::new()), 0, true).is_ok());
}

#[test]
fn test_handler_removed_after_failure() {
    let (plugin, record) = plugin();
    record.fail_headers.store(true, Ordering::SeqCst);

    assert!(
        plugin
            .on_http_request(request(&LogSink::new()), 0, true)
            .is_err()
    );
    assert!(!record.request_handler_installed.load(Ordering::SeqCst));

    record.fail_headers.store(false, Ordering::SeqCst);
    assert!(
        plugin
            .on_http_request(request(&LogSink::new()), 0, true)
            .is_ok()
    );
    assert!(!record.request_handler_installed.load(Ordering::SeqCst));
}

#[test]
fn test_second_handler_replaces_first() {
    let (plugin, record) = plugin();
    let first = LogSink::new();
    let second = LogSink::new();
    let id = plugin.next_context_id().unwrap();

    {
        let mut guard = plugin.lock().unwrap();
        let root = guard.ensure_root().unwrap();
        let context = guard.context_mut();

        let _ = context.set_handler(request(&first));
        let replaced = context.set_handler(request(&second));
        assert!(replaced.log_level().is_ok());

        context
            .create_context(id, root, ContextType::HttpContext)
            .unwrap();
        context.on_request_headers(id, 1, true).unwrap();
        assert!(context.on_done(id).unwrap());
    }

    assert!(first.is_empty());
    assert_eq!(second.messages(), vec![format!("headers for {id}")]);
    assert!(!record.request_handler_installed.load(Ordering::SeqCst));
}

// ============================================================================
// Test: Ownership limits
// ============================================================================

#[test]
fn test_lock_timeout() {
    let config = PluginConfig {
        lock_timeout_ms: Some(20),
    };
    let (plugin, _) = plugin_with(&config);

    let guard = plugin.lock().unwrap();
    thread::scope(|s| {
        let waiter = s.spawn(|| plugin.on_http_request(request(&LogSink::new()), 0, true));
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(matches!(
            err,
            RequestError::Runtime(RuntimeError::LockTimeout { waited_ms: 20 })
        ));
    });
    drop(guard);

    assert!(plugin.on_http_request(request(&LogSink::new()), 0, true).is_ok());
}

#[test]
fn test_stopped_plugin_is_unhealthy() {
    let (plugin, record) = plugin();
    plugin.stop();

    let err = plugin
        .on_http_request(request(&LogSink::new()), 0, true)
        .unwrap_err();
    assert!(err.is_unhealthy());
    assert!(record.created.lock().is_empty());
}
