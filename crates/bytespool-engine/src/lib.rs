//! Record buffering between a source and a destination.
//!
//! Records are grouped per stream under a shared memory budget, flushed
//! when size or stream-count thresholds trip, and checkpoint markers are
//! only emitted once every record they cover has been written.
//!
//! Two modes share the allocator and checkpoint tracker:
//!
//! - synchronous: [`BufferRegistry`] owns one [`RecordBuffer`] per stream
//!   and flushes inline through a [`StreamWriter`];
//! - concurrent: producers push through [`BufferEnqueue`] into per-stream
//!   queues, and an [`AsyncFlusher`] drains them on its own thread.

#![warn(clippy::pedantic)]

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod dequeue;
pub mod enqueue;
pub mod errors;
pub mod flush;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod registry;

pub use buffer::{
    BufferFactory, InMemoryBufferFactory, RecordBuffer, StateEmitter, StreamBuffer, StreamWriter,
};
pub use checkpoint::{CheckpointStatus, CheckpointTracker, TrackedCheckpoint};
pub use config::EngineConfig;
pub use dequeue::{BufferDequeue, MemoryAwareBatch};
pub use enqueue::{BackpressurePolicy, BufferEnqueue};
pub use errors::{BufferError, CloseFailure};
pub use flush::{AsyncFlusher, BatchWriter, FlushOutcome};
pub use manager::BufferManager;
pub use memory::{MemoryAllocator, MemoryManager};
pub use queue::{QueuedRecord, StreamAwareQueue, StreamQueues};
pub use registry::{BufferRegistry, FlushLimits, FlushType};
