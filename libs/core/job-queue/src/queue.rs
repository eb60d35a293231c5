//! Logical queue identity.

use crate::error::{QueueError, QueueResult};
use std::fmt;

/// Namespace used when none is given
pub const DEFAULT_NAMESPACE: &str = "queue";

/// A logical queue, identified by name within a namespace.
///
/// The namespace partitions every derived storage key and exchange name, so
/// several systems can share one broker without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    name: String,
    namespace: String,
}

impl Queue {
    /// Create a queue in the default namespace.
    pub fn new(name: impl Into<String>) -> QueueResult<Self> {
        Self::with_namespace(name, DEFAULT_NAMESPACE)
    }

    /// Create a queue in an explicit namespace.
    ///
    /// Fails if either the name or the namespace is blank.
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> QueueResult<Self> {
        let name = name.into();
        let namespace = namespace.into();

        if name.trim().is_empty() {
            return Err(QueueError::config("queue name must not be empty"));
        }
        if namespace.trim().is_empty() {
            return Err(QueueError::config("queue namespace must not be empty"));
        }

        Ok(Self { name, namespace })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}
