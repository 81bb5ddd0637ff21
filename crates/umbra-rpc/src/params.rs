//! RPC parameter bags.
//!
//! An ordered list of named byte values, addressable by name or by
//! position. Callees reject unknown names as malformed arguments; callers
//! treat a reply whose named value has the wrong length the same way.

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// An ordered list of `(name, bytes)` parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcParams(Vec<(String, Vec<u8>)>);

impl RpcParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named value. Order is preserved on the wire.
    pub fn add(mut self, name: &str, value: Vec<u8>) -> Self {
        self.0.push((name.to_string(), value));
        self
    }

    /// Value by name.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MalformedArgument`] if the name is absent.
    pub fn value(&self, name: &str) -> Result<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| RpcError::MalformedArgument(format!("missing parameter {name}")))
    }

    /// Value by name with an exact length requirement.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MalformedArgument`] if absent or the length
    /// differs.
    pub fn value_exact(&self, name: &str, len: usize) -> Result<&[u8]> {
        let v = self.value(name)?;
        if v.len() != len {
            return Err(RpcError::MalformedArgument(format!(
                "parameter {name} has length {}, expected {len}",
                v.len()
            )));
        }
        Ok(v)
    }

    /// Value by position.
    pub fn value_at(&self, index: usize) -> Result<&[u8]> {
        self.0
            .get(index)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| RpcError::MalformedArgument(format!("no parameter at {index}")))
    }

    /// All values under a name, in order. Used for repeated parameters
    /// (e.g. one `peer` entry per result).
    pub fn values(&self, name: &str) -> Vec<&[u8]> {
        self.0
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
