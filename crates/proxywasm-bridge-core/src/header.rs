//! Header adapter contract.
//!
//! A [`HeaderMap`] wraps a host-side header collection so capability
//! handlers can expose it to the guest without knowing the host
//! framework's representation. Lookup and iteration are mandatory; every
//! mutation is optional and may be declined with
//! [`HeaderMapError::Unsupported`].

use proxywasm_bridge_common::HeaderMapError;

/// Uniform read/mutate/iterate view over a header collection.
pub trait HeaderMap: Send {
    /// Look up the value for `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Visit every pair in the collection's native order.
    ///
    /// Iteration stops as soon as `visit` returns `false`.
    fn range(&self, visit: &mut dyn FnMut(&str, &str) -> bool);

    /// Replace all values of `key` with `value`.
    fn set(&mut self, _key: &str, _value: &str) -> Result<(), HeaderMapError> {
        Err(HeaderMapError::Unsupported { operation: "set" })
    }

    /// Append `value` to `key`.
    fn add(&mut self, _key: &str, _value: &str) -> Result<(), HeaderMapError> {
        Err(HeaderMapError::Unsupported { operation: "add" })
    }

    /// Remove every value of `key`.
    fn del(&mut self, _key: &str) -> Result<(), HeaderMapError> {
        Err(HeaderMapError::Unsupported { operation: "del" })
    }

    /// Deep copy of the collection.
    fn clone_map(&self) -> Result<Box<dyn HeaderMap>, HeaderMapError> {
        Err(HeaderMapError::Unsupported { operation: "clone" })
    }

    /// Serialized size of the collection in bytes.
    fn byte_size(&self) -> Result<u64, HeaderMapError> {
        Err(HeaderMapError::Unsupported {
            operation: "byte_size",
        })
    }

    /// Collect every pair in native order.
    fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        self.range(&mut |key, value| {
            pairs.push((key.to_string(), value.to_string()));
            true
        });
        pairs
    }
}
