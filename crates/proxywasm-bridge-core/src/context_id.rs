//! Context identifier allocation.

use std::sync::atomic::{AtomicI32, Ordering};

use proxywasm_bridge_common::RuntimeError;

use crate::abi::ContextId;

/// Monotonic allocator of context ids.
///
/// Id `0` is reserved for "no parent", so the first id handed out is `1`.
/// A generator can be shared between plugins through an `Arc`; ids are
/// unique across everything drawing from the same generator.
#[derive(Debug, Default)]
pub struct ContextIdGenerator {
    last: AtomicI32,
}

impl ContextIdGenerator {
    /// Create a generator whose first id is `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ContextIdExhausted`] once `i32::MAX` has been
    /// handed out. Ids never wrap.
    pub fn next(&self) -> Result<ContextId, RuntimeError> {
        self.last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                last.checked_add(1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| RuntimeError::ContextIdExhausted)
    }

    /// Last id handed out, `0` if none.
    pub fn last(&self) -> ContextId {
        self.last.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn starting_at(last: ContextId) -> Self {
        Self {
            last: AtomicI32::new(last),
        }
    }
}
