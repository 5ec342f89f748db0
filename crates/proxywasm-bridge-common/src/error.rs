//! Error types for proxywasm-bridge.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Guest lifecycle and protocol errors surfaced to the request driver
//! - [`HostFunctionError`]: Failures of a capability invoked by the guest
//! - [`HeaderMapError`]: Failures of a header adapter

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur while loading the guest
/// module and while driving it through the context lifecycle.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The guest module could not be compiled or instantiated.
    ///
    /// This is fatal: there is no guest left to serve any unit of work.
    #[error("Guest load failed: {reason}")]
    GuestLoad {
        /// Description of the load failure.
        reason: String,
    },

    /// A guest export trapped or reported a failure.
    ///
    /// Only the originating unit of work fails; the instance stays usable.
    #[error("Guest trap: {message}")]
    GuestTrap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// The guest instance is stopped or was never started.
    #[error("Guest unhealthy: {reason}")]
    GuestUnhealthy {
        /// Why the instance cannot serve calls.
        reason: String,
    },

    /// A guest call exhausted its fuel budget.
    ///
    /// The instance is stopped afterwards since the guest was interrupted
    /// in the middle of its own bookkeeping.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Exclusive ownership of the guest could not be acquired in time.
    #[error("Lock timeout after {waited_ms}ms")]
    LockTimeout {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },

    /// The context id space of a generator is used up.
    #[error("Context id space exhausted")]
    ContextIdExhausted,

    /// An operation was called out of lifecycle order.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the violated ordering.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A host capability failed outside of a guest call.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from capability implementations.
///
/// None of these ever terminate the host: the linker converts each one into
/// a result code that is handed back to the guest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// The installed handler does not provide this capability.
    #[error("Capability not implemented: {capability}")]
    Unimplemented {
        /// Name of the declined capability.
        capability: &'static str,
    },

    /// The requested item does not exist.
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Invalid argument was passed by the guest.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The capability exists but declines this operation (e.g. a read-only adapter).
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// The declined operation.
        operation: &'static str,
    },

    /// A guest pointer or length fell outside linear memory.
    #[error("Invalid memory access at {ptr} (len {len})")]
    InvalidMemoryAccess {
        /// Guest pointer.
        ptr: i32,
        /// Requested length.
        len: i32,
    },

    /// The host failed for a reason the guest cannot act on.
    #[error("Internal failure: {reason}")]
    Internal {
        /// Description of the failure.
        reason: String,
    },
}

/// Header adapter errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderMapError {
    /// The adapter is read-only or otherwise declines the operation.
    #[error("Header map does not support {operation}")]
    Unsupported {
        /// The declined operation (`set`, `add`, `del`, `clone`, `byte_size`).
        operation: &'static str,
    },

    /// The key or value is not a valid header.
    #[error("Invalid header: {reason}")]
    InvalidHeader {
        /// Description of the validation failure.
        reason: String,
    },
}

impl From<HeaderMapError> for HostFunctionError {
    fn from(err: HeaderMapError) -> Self {
        match err {
            HeaderMapError::Unsupported { operation } => Self::Unsupported { operation },
            HeaderMapError::InvalidHeader { reason } => Self::InvalidArgument { reason },
        }
    }
}

impl RuntimeError {
    /// Create a new `GuestLoad` error.
    pub fn guest_load(reason: impl Into<String>) -> Self {
        Self::GuestLoad {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestTrap` error without a trap code.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::GuestTrap {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new `GuestUnhealthy` error.
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::GuestUnhealthy {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidState` error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if a guest export call failed.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::GuestTrap { .. } | Self::FuelExhausted)
    }

    /// Returns `true` if the guest cannot serve further units of work.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            Self::GuestUnhealthy { .. } | Self::GuestLoad { .. } | Self::FuelExhausted
        )
    }

    /// Returns `true` if this error came from the caller-imposed lock bound.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl HostFunctionError {
    /// Create a new `Unimplemented` error.
    pub fn unimplemented(capability: &'static str) -> Self {
        Self::Unimplemented { capability }
    }

    /// Create a new `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the handler declined the capability.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented { .. })
    }
}
