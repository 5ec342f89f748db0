//! Owned header collection.

use proxywasm_bridge_common::HeaderMapError;
use proxywasm_bridge_core::HeaderMap;

/// Ordered, case-insensitive header pairs owned by the host.
///
/// Supports every optional [`HeaderMap`] operation. Duplicate names are
/// kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPairs {
    pairs: Vec<(String, String)>,
}

impl HeaderPairs {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pairs, counting duplicates.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns `true` if there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Consume into the underlying pairs.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }

    fn validate(key: &str) -> Result<(), HeaderMapError> {
        if key.is_empty() {
            return Err(HeaderMapError::InvalidHeader {
                reason: "empty header name".into(),
            });
        }
        if key.contains('\0') {
            return Err(HeaderMapError::InvalidHeader {
                reason: format!("header name {key:?} contains NUL"),
            });
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderPairs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl HeaderMap for HeaderPairs {
    fn get(&self, key: &str) -> Option<String> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        for (k, v) in &self.pairs {
            if !visit(k, v) {
                break;
            }
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), HeaderMapError> {
        Self::validate(key)?;

        let mut replaced = false;
        self.pairs.retain_mut(|(k, v)| {
            if !k.eq_ignore_ascii_case(key) {
                return true;
            }
            if replaced {
                return false;
            }
            value.clone_into(v);
            replaced = true;
            true
        });

        if !replaced {
            self.pairs.push((key.to_string(), value.to_string()));
        }
        Ok(())
    }

    fn add(&mut self, key: &str, value: &str) -> Result<(), HeaderMapError> {
        Self::validate(key)?;
        self.pairs.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<(), HeaderMapError> {
        self.pairs.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        Ok(())
    }

    fn clone_map(&self) -> Result<Box<dyn HeaderMap>, HeaderMapError> {
        Ok(Box::new(self.clone()))
    }

    fn byte_size(&self) -> Result<u64, HeaderMapError> {
        Ok(self
            .pairs
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }
}
