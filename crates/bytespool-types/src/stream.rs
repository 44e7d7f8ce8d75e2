//! Stream identity.
//!
//! A [`StreamDescriptor`] is the `(namespace, name)` pair every record and
//! per-stream checkpoint is keyed by. Two descriptors with the same pair
//! always map to the same buffer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a stream: an optional namespace plus a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Namespace (schema, dataset, ...). `None` when the source has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Stream name.
    pub name: String,
}

impl StreamDescriptor {
    /// Create a descriptor without a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Create a descriptor with a namespace.
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Borrow the stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow the namespace, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
