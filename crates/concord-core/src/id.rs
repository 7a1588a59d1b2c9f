//! Identity types for Concord
//!
//! Contexts are named on the wire, so identifiers are cheap-to-clone
//! shared strings rather than numeric ids.

use std::fmt;
use std::sync::Arc;

/// Context identity - one isolated execution environment
/// (background coordinator, foreground surface, per-tab injector)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Arc<str>);

impl ContextId {
    #[inline]
    pub fn new(name: impl AsRef<str>) -> Self {
        ContextId(Arc::from(name.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(name: &str) -> Self {
        ContextId::new(name)
    }
}

impl From<String> for ContextId {
    fn from(name: String) -> Self {
        ContextId(Arc::from(name))
    }
}

/// Query correlation id - unique per origin context
/// Format: `<origin>:<seq>`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Build a request id from the issuing context and its local sequence number
    pub fn for_origin(origin: &ContextId, seq: u64) -> Self {
        RequestId(Arc::from(format!("{}:{}", origin, seq)))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(raw: &str) -> Self {
        RequestId(Arc::from(raw))
    }
}

impl From<String> for RequestId {
    fn from(raw: String) -> Self {
        RequestId(Arc::from(raw))
    }
}
