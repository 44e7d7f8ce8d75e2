//! Incoming message model.
//!
//! Upstream emits an interleaved sequence of records and state markers,
//! one JSON object per line. Only the fields the engine routes on are
//! modelled; record payloads stay opaque.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointMarker;
use crate::stream::StreamDescriptor;

/// Kind of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Record,
    State,
}

/// A data record tagged with its source stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub stream: String,
    pub data: serde_json::Value,
    /// Source emission time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<i64>,
}

impl RecordMessage {
    /// Stream identity this record routes to.
    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            namespace: self.namespace.clone(),
            name: self.stream.clone(),
        }
    }
}

/// One message of the incoming sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingMessage {
    Record { record: RecordMessage },
    State { state: CheckpointMarker },
}

impl IncomingMessage {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Record { .. } => MessageType::Record,
            Self::State { .. } => MessageType::State,
        }
    }

    /// Stream a record routes to; `None` for state messages.
    #[must_use]
    pub fn record_stream(&self) -> Option<StreamDescriptor> {
        match self {
            Self::Record { record } => Some(record.descriptor()),
            Self::State { .. } => None,
        }
    }
}
