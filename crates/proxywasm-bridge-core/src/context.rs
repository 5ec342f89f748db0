//! ABI context over one guest instance.
//!
//! [`AbiContext`] is the only path from the host to the guest's exports. It
//! enforces the import registration order and traces every guest call with
//! the context id it targets.

use tracing::debug;

use crate::abi::{Action, ContextId, ContextType};
use crate::handler::ImportsHandler;
use crate::instance::GuestInstance;
use proxywasm_bridge_common::RuntimeError;

/// Exclusive owner of one [`GuestInstance`].
///
/// Methods take `&mut self`; concurrent units of work share a context only
/// through the plugin's ownership guard.
#[derive(Debug)]
pub struct AbiContext<I> {
    instance: I,
    imports_registered: bool,
}

impl<I: GuestInstance> AbiContext<I> {
    /// Wrap an instance that has neither imports nor a running guest yet.
    pub fn new(instance: I) -> Self {
        Self {
            instance,
            imports_registered: false,
        }
    }

    /// Register host imports on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidState`] when called twice or after
    /// the instance has started.
    pub fn register_imports(&mut self) -> Result<(), RuntimeError> {
        if self.imports_registered {
            return Err(RuntimeError::invalid_state("imports already registered"));
        }
        if self.instance.is_running() {
            return Err(RuntimeError::invalid_state(
                "imports must be registered before start",
            ));
        }

        self.instance.register_imports()?;
        self.imports_registered = true;
        Ok(())
    }

    /// Start the guest.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        self.instance.start()
    }

    /// Stop the guest.
    pub fn stop(&mut self) {
        self.instance.stop();
    }

    /// Whether the guest accepts calls.
    pub fn is_running(&self) -> bool {
        self.instance.is_running()
    }

    /// Install `handler` for host imports and return the previous one.
    pub fn set_handler(&mut self, handler: Box<dyn ImportsHandler>) -> Box<dyn ImportsHandler> {
        self.instance.set_handler(handler)
    }

    /// Create context `id` under `parent` inside the guest.
    pub fn create_context(
        &mut self,
        id: ContextId,
        parent: ContextId,
        kind: ContextType,
    ) -> Result<(), RuntimeError> {
        debug!(context_id = id, parent_id = parent, kind = ?kind, "proxy_on_context_create");
        self.instance.proxy_on_context_create(id, parent, kind)
    }

    /// Deliver request headers to context `id`.
    pub fn on_request_headers(
        &mut self,
        id: ContextId,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<Action, RuntimeError> {
        debug!(
            context_id = id,
            header_count, end_of_stream, "proxy_on_request_headers"
        );
        self.instance
            .proxy_on_request_headers(id, header_count, end_of_stream)
    }

    /// Tear down context `id`.
    pub fn on_done(&mut self, id: ContextId) -> Result<bool, RuntimeError> {
        debug!(context_id = id, "proxy_on_done");
        self.instance.proxy_on_done(id)
    }

    /// Borrow the wrapped instance.
    pub fn instance(&self) -> &I {
        &self.instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultImportsHandler;

    #[derive(Default)]
    struct Recorder {
        running: bool,
        registrations: u32,
        calls: Vec<String>,
    }

    impl GuestInstance for Recorder {
        fn register_imports(&mut self) -> Result<(), RuntimeError> {
            self.registrations += 1;
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
            self.calls.push("set_handler".into());
            handler
        }

        fn proxy_on_context_create(
            &mut self,
            context_id: ContextId,
            parent_id: ContextId,
            kind: ContextType,
        ) -> Result<(), RuntimeError> {
            self.calls
                .push(format!("create {context_id} {parent_id} {}", kind.as_i32()));
            Ok(())
        }

        fn proxy_on_request_headers(
            &mut self,
            context_id: ContextId,
            header_count: u32,
            end_of_stream: bool,
        ) -> Result<Action, RuntimeError> {
            self.calls
                .push(format!("headers {context_id} {header_count} {end_of_stream}"));
            Ok(Action::Continue)
        }

        fn proxy_on_done(&mut self, context_id: ContextId) -> Result<bool, RuntimeError> {
            self.calls.push(format!("done {context_id}"));
            Ok(true)
        }
    }

    #[test]
    fn test_register_imports_once() {
        let mut context = AbiContext::new(Recorder::default());

        context.register_imports().unwrap();
        let err = context.register_imports().unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert_eq!(context.instance().registrations, 1);
    }

    #[test]
    fn test_register_imports_after_start_is_invalid() {
        let mut context = AbiContext::new(Recorder::default());
        context.start().unwrap();

        let err = context.register_imports().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert_eq!(context.instance().registrations, 0);
    }

    #[test]
    fn test_calls_forward_to_instance() {
        let mut context = AbiContext::new(Recorder::default());
        context.register_imports().unwrap();
        context.start().unwrap();
        assert!(context.is_running());

        context.set_handler(Box::new(DefaultImportsHandler));
        context.create_context(2, 1, ContextType::HttpContext).unwrap();
        assert_eq!(
            context.on_request_headers(2, 3, true).unwrap(),
            Action::Continue
        );
        assert!(context.on_done(2).unwrap());

        assert_eq!(
            context.instance().calls,
            vec!["set_handler", "create 2 1 4", "headers 2 3 true", "done 2"]
        );

        context.stop();
        assert!(!context.is_running());
    }
}
