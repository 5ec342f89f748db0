//! Exclusive ownership of the shared guest.
//!
//! A [`WasmPlugin`] is the one guest instance every unit of work shares.
//! Work runs in three phases:
//!
//! 1. Allocate a leaf context id (no lock held)
//! 2. Acquire the plugin, creating the root context on first use
//! 3. Run the HTTP protocol against the leaf, then release
//!
//! The lock is held across create, process and teardown, so the guest never
//! observes two contexts interleaving.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{Span, info, instrument, warn};

use crate::abi::{Action, ContextId, ContextType, NO_PARENT};
use crate::context::AbiContext;
use crate::context_id::ContextIdGenerator;
use crate::handler::{DefaultImportsHandler, ImportsHandler};
use crate::instance::{GuestInstance, WasmtimeInstance};
use proxywasm_bridge_common::{PluginConfig, RuntimeError};

/// Result of one completed HTTP unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Leaf context the request ran in.
    pub context_id: ContextId,
    /// Disposition returned from `proxy_on_request_headers`.
    pub action: Action,
    /// Whether the guest allowed teardown to complete immediately.
    pub done: bool,
}

/// Failure inside the create, process and teardown protocol.
///
/// Processing and teardown are reported independently: a request whose
/// processing trapped still had `proxy_on_done` invoked, and that call can
/// fail on its own.
#[derive(Debug, Error)]
#[error("context {context_id}: {}", describe(.processing.as_ref(), .teardown.as_ref()))]
pub struct ProtocolError {
    /// Leaf context the failure belongs to.
    pub context_id: ContextId,
    /// Action returned when processing itself succeeded.
    pub action: Option<Action>,
    /// Failure creating the context or processing headers.
    pub processing: Option<RuntimeError>,
    /// Failure during `proxy_on_done`.
    pub teardown: Option<RuntimeError>,
}

impl ProtocolError {
    /// The failure that determines the outcome: processing first, then teardown.
    pub fn primary(&self) -> Option<&RuntimeError> {
        self.processing.as_ref().or(self.teardown.as_ref())
    }
}

fn describe(processing: Option<&RuntimeError>, teardown: Option<&RuntimeError>) -> String {
    match (processing, teardown) {
        (Some(p), Some(t)) => format!("processing failed: {p}; teardown failed: {t}"),
        (Some(p), None) => format!("processing failed: {p}"),
        (None, Some(t)) => format!("teardown failed: {t}"),
        (None, None) => "unknown failure".to_string(),
    }
}

/// Error from a full unit of work.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Failed before the protocol started: id allocation, locking, root creation.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The protocol ran and failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl RequestError {
    /// The underlying runtime error.
    pub fn runtime(&self) -> Option<&RuntimeError> {
        match self {
            Self::Runtime(err) => Some(err),
            Self::Protocol(err) => err.primary(),
        }
    }

    /// Returns `true` if the guest can no longer serve requests.
    pub fn is_unhealthy(&self) -> bool {
        self.runtime().is_some_and(RuntimeError::is_unhealthy)
    }

    /// Returns `true` if ownership of the guest could not be acquired in time.
    pub fn is_lock_timeout(&self) -> bool {
        self.runtime().is_some_and(RuntimeError::is_lock_timeout)
    }
}

/// The single shared guest and its context bookkeeping.
///
/// # Thread Safety
///
/// `WasmPlugin` is `Sync`; share it through an `Arc`. All guest calls go
/// through [`PluginGuard`], which holds the ownership lock.
pub struct WasmPlugin<I = WasmtimeInstance> {
    context: Mutex<AbiContext<I>>,
    root: OnceLock<ContextId>,
    root_id: ContextId,
    ids: Arc<ContextIdGenerator>,
    lock_timeout: Option<Duration>,
}

impl<I: GuestInstance> WasmPlugin<I> {
    /// Register imports, start the guest and reserve the root context id.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest cannot be started.
    pub fn new(instance: I, config: &PluginConfig) -> Result<Self, RuntimeError> {
        Self::with_ids(instance, config, Arc::new(ContextIdGenerator::new()))
    }

    /// Like [`new`](Self::new), drawing ids from a shared generator.
    pub fn with_ids(
        instance: I,
        config: &PluginConfig,
        ids: Arc<ContextIdGenerator>,
    ) -> Result<Self, RuntimeError> {
        let mut context = AbiContext::new(instance);
        context.register_imports()?;
        context.start()?;

        let root_id = ids.next()?;
        info!(root_id, lock_timeout = ?config.lock_timeout(), "Plugin ready");

        Ok(Self {
            context: Mutex::new(context),
            root: OnceLock::new(),
            root_id,
            ids,
            lock_timeout: config.lock_timeout(),
        })
    }

    /// Id reserved for the root context.
    pub fn root_id(&self) -> ContextId {
        self.root_id
    }

    /// Whether the root context has been created inside the guest.
    pub fn root_created(&self) -> bool {
        self.root.get().is_some()
    }

    /// Allocate a fresh leaf context id.
    pub fn next_context_id(&self) -> Result<ContextId, RuntimeError> {
        self.ids.next()
    }

    /// Whether the guest accepts calls. Waits for the current owner.
    pub fn is_running(&self) -> bool {
        self.context.lock().is_running()
    }

    /// Acquire exclusive ownership of the guest.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::LockTimeout`] if a lock timeout is configured
    /// and ownership was not acquired within it.
    pub fn lock(&self) -> Result<PluginGuard<'_, I>, RuntimeError> {
        let context = match self.lock_timeout {
            None => self.context.lock(),
            Some(timeout) => self.context.try_lock_for(timeout).ok_or_else(|| {
                let waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(waited_ms, "Timed out waiting for guest ownership");
                RuntimeError::LockTimeout { waited_ms }
            })?,
        };

        Ok(PluginGuard {
            context,
            plugin: self,
        })
    }

    /// Stop the guest. Later units of work fail with
    /// [`RuntimeError::GuestUnhealthy`].
    pub fn stop(&self) {
        self.context.lock().stop();
    }

    /// Run one HTTP unit of work to completion.
    ///
    /// `handler` is installed for the duration of the protocol and dropped
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Runtime`] if the work never reached the guest,
    /// and [`RequestError::Protocol`] if a guest call failed.
    #[instrument(skip_all, fields(context_id))]
    pub fn on_http_request(
        &self,
        handler: Box<dyn ImportsHandler>,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<RequestOutcome, RequestError> {
        let context_id = self.next_context_id()?;
        Span::current().record("context_id", context_id);

        let mut guard = self.lock()?;
        if !guard.is_running() {
            return Err(RuntimeError::unhealthy("guest instance is not running").into());
        }

        guard.ensure_root()?;
        let outcome = guard.run_http_request(context_id, handler, header_count, end_of_stream)?;
        Ok(outcome)
    }
}

impl<I> std::fmt::Debug for WasmPlugin<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmPlugin")
            .field("root_id", &self.root_id)
            .field("root_created", &self.root.get().is_some())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

/// Exclusive ownership of a [`WasmPlugin`]'s guest.
///
/// Dropping the guard reinstalls the default handler and releases the
/// guest, on error and unwinding paths alike.
pub struct PluginGuard<'a, I: GuestInstance> {
    context: MutexGuard<'a, AbiContext<I>>,
    plugin: &'a WasmPlugin<I>,
}

impl<I: GuestInstance> PluginGuard<'_, I> {
    /// Whether the guest accepts calls.
    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// The guest's ABI context, for driving protocol steps by hand.
    ///
    /// Whatever handler is left installed is replaced when the guard drops.
    pub fn context_mut(&mut self) -> &mut AbiContext<I> {
        &mut self.context
    }

    /// Create the root context if no unit of work has yet.
    ///
    /// A failed creation is returned to the caller and attempted again by
    /// the next owner.
    pub fn ensure_root(&mut self) -> Result<ContextId, RuntimeError> {
        if let Some(root) = self.plugin.root.get() {
            return Ok(*root);
        }

        let root_id = self.plugin.root_id;
        self.context
            .create_context(root_id, NO_PARENT, ContextType::PluginContext)?;

        // Only the lock holder sets the gate.
        let root = *self.plugin.root.get_or_init(|| root_id);
        info!(root_id = root, "Root context created");
        Ok(root)
    }

    /// Run create, process and teardown for leaf `context_id` with `handler`
    /// installed.
    ///
    /// Teardown runs whenever creation succeeded, even if processing failed.
    pub fn run_http_request(
        &mut self,
        context_id: ContextId,
        handler: Box<dyn ImportsHandler>,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<RequestOutcome, ProtocolError> {
        self.context.set_handler(handler);
        let result = self.http_protocol(context_id, header_count, end_of_stream);
        self.context.set_handler(Box::new(DefaultImportsHandler));
        result
    }

    fn http_protocol(
        &mut self,
        context_id: ContextId,
        header_count: u32,
        end_of_stream: bool,
    ) -> Result<RequestOutcome, ProtocolError> {
        let root_id = self.plugin.root_id;

        if let Err(err) = self
            .context
            .create_context(context_id, root_id, ContextType::HttpContext)
        {
            return Err(ProtocolError {
                context_id,
                action: None,
                processing: Some(err),
                teardown: None,
            });
        }

        let processing = self
            .context
            .on_request_headers(context_id, header_count, end_of_stream);
        let teardown = self.context.on_done(context_id);

        match (processing, teardown) {
            (Ok(action), Ok(done)) => Ok(RequestOutcome {
                context_id,
                action,
                done,
            }),
            (processing, teardown) => {
                let err = ProtocolError {
                    context_id,
                    action: processing.as_ref().ok().copied(),
                    processing: processing.err(),
                    teardown: teardown.err(),
                };
                warn!(context_id, error = %err, "HTTP context failed");
                Err(err)
            }
        }
    }
}

impl<I: GuestInstance> Drop for PluginGuard<'_, I> {
    fn drop(&mut self) {
        self.context.set_handler(Box::new(DefaultImportsHandler));
    }
}
