//! Identifier and endpoint types shared across the broker.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier correlating a dispatched step with its asynchronous response.
pub type MessageId = Uuid;

/// Identifier of one admitted pipeline (and of the tree node holding it).
pub type PipelineId = Uuid;

/// Network address of a remote model or a final receiver, e.g. `"127.0.0.1:9000"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Wrap an address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Borrow the address.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when no address was given.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for Endpoint {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}
