//! Checkpoint (state) marker types.
//!
//! A [`CheckpointMarker`] is an opaque resumption point emitted by the
//! source. The engine only cares about its [`CheckpointScope`]; the payload
//! is handed back to the orchestrator untouched once the records preceding
//! it are durable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::StreamDescriptor;

/// Which records a checkpoint covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointScope {
    /// Covers records of a single stream.
    Stream { stream: StreamDescriptor },
    /// Covers records of every stream.
    Global,
}

impl CheckpointScope {
    /// The stream this scope is bound to, `None` for global checkpoints.
    #[must_use]
    pub fn stream(&self) -> Option<&StreamDescriptor> {
        match self {
            Self::Stream { stream } => Some(stream),
            Self::Global => None,
        }
    }
}

/// Resumption point received from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    #[serde(flatten)]
    pub scope: CheckpointScope,
    /// Opaque source state, returned verbatim on emission.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CheckpointMarker {
    /// Marker scoped to one stream.
    #[must_use]
    pub fn stream(stream: StreamDescriptor, data: serde_json::Value) -> Self {
        Self {
            scope: CheckpointScope::Stream { stream },
            data,
        }
    }

    /// Marker covering every stream.
    #[must_use]
    pub fn global(data: serde_json::Value) -> Self {
        Self {
            scope: CheckpointScope::Global,
            data,
        }
    }
}

/// Receipt-ordered sequence number assigned to a tracked checkpoint.
///
/// Records are tagged with the id of the checkpoint that will cover them,
/// so ids are handed out before the checkpoint itself arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(u64);

impl CheckpointId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
