//! Shared stream, message, and checkpoint types for bytespool.

#![warn(clippy::pedantic)]

pub mod catalog;
pub mod checkpoint;
pub mod message;
pub mod stream;

pub use catalog::{ConfiguredCatalog, ConfiguredStream};
pub use checkpoint::{CheckpointId, CheckpointMarker, CheckpointScope};
pub use message::{IncomingMessage, MessageType, RecordMessage};
pub use stream::StreamDescriptor;
