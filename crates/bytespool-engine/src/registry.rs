//! Buffer registry and flush policy (synchronous mode).
//!
//! [`BufferRegistry`] owns one [`RecordBuffer`] per live stream, decides
//! after each record whether to flush one stream or all of them, and runs
//! the write -> promote -> emit -> clear sequence that couples checkpoint
//! emission to durable writes.
//!
//! A single-stream flush promotes every pending marker, including markers
//! of streams whose records are still buffered. Such a marker can be
//! reported slightly ahead of its stream's data; the all-streams flush at
//! end of run always catches the data up. Callers relying on strict
//! per-stream durability must flush all streams before trusting emitted
//! markers.

use std::collections::HashMap;
use std::sync::Arc;

use bytespool_types::{CheckpointId, CheckpointMarker, ConfiguredCatalog, StreamDescriptor};

use crate::buffer::{BufferFactory, RecordBuffer, StateEmitter, StreamWriter};
use crate::checkpoint::CheckpointTracker;
use crate::errors::{BufferError, CloseFailure, Result};
use crate::memory::MemoryAllocator;

/// Thresholds that trigger a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushLimits {
    /// Flush every stream once the sum of all buffers reaches this.
    pub max_total_bytes: u64,
    /// Flush one stream once its buffer reaches this.
    pub max_per_stream_bytes: u64,
    /// Flush every stream once this many buffers are live.
    pub max_concurrent_streams: usize,
}

impl FlushLimits {
    /// 256 MiB default total.
    pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;
    /// 64 MiB default per stream.
    pub const DEFAULT_MAX_PER_STREAM_BYTES: u64 = 64 * 1024 * 1024;
    /// 10 default concurrent buffers.
    pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 10;

    /// # Errors
    ///
    /// Returns [`BufferError::Config`] if any limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_total_bytes == 0 {
            return Err(BufferError::Config("max_total_bytes must be > 0".into()));
        }
        if self.max_per_stream_bytes == 0 {
            return Err(BufferError::Config("max_per_stream_bytes must be > 0".into()));
        }
        if self.max_concurrent_streams == 0 {
            return Err(BufferError::Config(
                "max_concurrent_streams must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FlushLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: Self::DEFAULT_MAX_TOTAL_BYTES,
            max_per_stream_bytes: Self::DEFAULT_MAX_PER_STREAM_BYTES,
            max_concurrent_streams: Self::DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

/// Which flush, if any, a record triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Only the record's stream was flushed.
    SingleStream,
    /// Every live stream was flushed.
    All,
}

struct BufferSlot {
    buffer: Box<dyn RecordBuffer>,
    allocated: u64,
}

/// Per-run owner of every stream buffer.
pub struct BufferRegistry {
    factory: Box<dyn BufferFactory>,
    writer: Box<dyn StreamWriter>,
    emitter: Box<dyn StateEmitter>,
    catalog: ConfiguredCatalog,
    limits: FlushLimits,
    memory: Arc<dyn MemoryAllocator>,
    tracker: Arc<CheckpointTracker>,
    buffers: HashMap<StreamDescriptor, BufferSlot>,
    total_bytes: u64,
}

impl BufferRegistry {
    /// Create a registry for one run.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Config`] if `limits` are invalid.
    pub fn new(
        factory: impl BufferFactory + 'static,
        writer: impl StreamWriter + 'static,
        emitter: impl StateEmitter + 'static,
        catalog: ConfiguredCatalog,
        limits: FlushLimits,
        memory: Arc<dyn MemoryAllocator>,
    ) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            factory: Box::new(factory),
            writer: Box::new(writer),
            emitter: Box::new(emitter),
            catalog,
            limits,
            memory,
            tracker: Arc::new(CheckpointTracker::new()),
            buffers: HashMap::new(),
            total_bytes: 0,
        })
    }

    /// Share an existing tracker instead of the registry's own.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<CheckpointTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<CheckpointTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn limits(&self) -> FlushLimits {
        self.limits
    }

    /// Bytes buffered across every stream.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of live stream buffers.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes buffered for `stream`, `None` when it has no live buffer.
    #[must_use]
    pub fn stream_bytes(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.buffers.get(stream).map(|slot| slot.buffer.byte_count())
    }

    /// Records buffered for `stream`, `None` when it has no live buffer.
    #[must_use]
    pub fn stream_record_count(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.buffers.get(stream).map(|slot| slot.buffer.record_count())
    }

    /// Memory currently granted to `stream`'s buffer.
    #[must_use]
    pub fn stream_allocation(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.buffers.get(stream).map(|slot| slot.allocated)
    }

    /// Buffer one record and flush if a threshold was reached.
    ///
    /// Total-bytes and stream-count limits take precedence and flush every
    /// stream; otherwise the per-stream limit flushes only `stream`.
    ///
    /// # Errors
    ///
    /// Propagates buffer creation, append, and flush failures.
    pub fn add_record(
        &mut self,
        stream: &StreamDescriptor,
        record: &[u8],
    ) -> Result<Option<FlushType>> {
        self.ensure_buffer(stream)?;
        let checkpoint = self.tracker.record_arrived(stream)?;

        let Some(slot) = self.buffers.get_mut(stream) else {
            self.tracker.record_rejected(stream)?;
            return Err(BufferError::UnknownStream(stream.clone()));
        };
        let added = match slot.buffer.accept(record, checkpoint) {
            Ok(added) => added,
            Err(source) => {
                self.tracker.record_rejected(stream)?;
                return Err(BufferError::Accept {
                    stream: stream.clone(),
                    source,
                });
            }
        };
        self.total_bytes += added;

        let stream_bytes = slot.buffer.byte_count();
        while stream_bytes > slot.allocated {
            // A zero grant is fine here: the byte limits bound memory in this mode.
            let granted = self.memory.request_memory();
            if granted == 0 {
                break;
            }
            slot.allocated += granted;
        }

        if self.total_bytes >= self.limits.max_total_bytes
            || self.buffers.len() >= self.limits.max_concurrent_streams
        {
            self.flush_all_streams()?;
            Ok(Some(FlushType::All))
        } else if stream_bytes >= self.limits.max_per_stream_bytes {
            self.flush_single_stream(stream)?;
            Ok(Some(FlushType::SingleStream))
        } else {
            Ok(None)
        }
    }

    /// Register a checkpoint marker. It is emitted after the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the tracker lock is poisoned.
    pub fn add_state(&mut self, marker: CheckpointMarker, size_hint: u64) -> Result<CheckpointId> {
        self.tracker.track_checkpoint(marker, size_hint)
    }

    fn ensure_buffer(&mut self, stream: &StreamDescriptor) -> Result<()> {
        if self.buffers.contains_key(stream) {
            return Ok(());
        }
        tracing::info!(
            stream = %stream,
            buffered_bytes = self.total_bytes,
            buffers = self.buffers.len(),
            "Starting a new buffer for stream"
        );
        let buffer = self
            .factory
            .create_buffer(stream, &self.catalog)
            .map_err(|source| {
                tracing::error!(stream = %stream, "Failed to create a new buffer: {source:#}");
                BufferError::CreateBuffer {
                    stream: stream.clone(),
                    source,
                }
            })?;
        let allocated = self.memory.request_memory();
        self.buffers
            .insert(stream.clone(), BufferSlot { buffer, allocated });
        Ok(())
    }

    /// Write one stream's buffer, emit committed markers, and drop the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::UnknownStream`] if `stream` has no buffer, or
    /// [`BufferError::Write`] if the write fails. On write failure the buffer,
    /// its memory, and every pending marker are left as they were.
    pub fn flush_single_stream(&mut self, stream: &StreamDescriptor) -> Result<()> {
        let Some(slot) = self.buffers.get_mut(stream) else {
            return Err(BufferError::UnknownStream(stream.clone()));
        };
        let bytes = slot.buffer.byte_count();
        tracing::info!(stream = %stream, bytes, "Flushing buffer of stream");
        self.writer
            .write_buffer(stream, slot.buffer.as_mut())
            .map_err(|source| BufferError::Write {
                stream: stream.clone(),
                source,
            })?;

        self.emit_committed_states()?;

        if let Some(mut slot) = self.buffers.remove(stream) {
            self.total_bytes = self.total_bytes.saturating_sub(slot.buffer.byte_count());
            if let Err(err) = slot.buffer.close() {
                tracing::warn!(stream = %stream, "Buffer close failed after flush: {err:#}");
            }
            self.memory.free(slot.allocated);
        }
        tracing::info!(stream = %stream, bytes, "Flushing completed");
        Ok(())
    }

    /// Write every buffer, emit committed markers, then close and drop them all.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Write`] on the first failed write, leaving every
    /// buffer and pending marker in place. Returns [`BufferError::Close`] if
    /// closing fails; the buffers are dropped and their memory released anyway.
    pub fn flush_all_streams(&mut self) -> Result<()> {
        tracing::info!(
            buffers = self.buffers.len(),
            bytes = self.total_bytes,
            "Flushing all current buffers"
        );
        for (stream, slot) in &mut self.buffers {
            tracing::info!(
                stream = %stream,
                bytes = slot.buffer.byte_count(),
                "Flushing buffer of stream"
            );
            self.writer
                .write_buffer(stream, slot.buffer.as_mut())
                .map_err(|source| BufferError::Write {
                    stream: stream.clone(),
                    source,
                })?;
            tracing::info!(stream = %stream, "Flushing completed");
        }
        self.emit_committed_states()?;
        self.close_all()
    }

    /// Close every live buffer without writing it.
    ///
    /// Every buffer is attempted even if some fail; failures are reported
    /// together. Buffered data that was not flushed is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Close`] listing every buffer that failed to close.
    pub fn close(&mut self) -> Result<()> {
        if self.total_bytes > 0 {
            tracing::warn!(
                buffers = self.buffers.len(),
                bytes = self.total_bytes,
                "Closing buffers with unflushed data"
            );
        }
        self.close_all()
    }

    fn close_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for (stream, mut slot) in self.buffers.drain() {
            tracing::info!(stream = %stream, "Closing buffer for stream");
            if let Err(error) = slot.buffer.close() {
                tracing::error!(stream = %stream, "Failed to close stream buffer: {error:#}");
                failures.push(CloseFailure { stream, error });
            }
            self.memory.free(slot.allocated);
        }
        self.total_bytes = 0;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BufferError::Close { failures })
        }
    }

    /// Promote pending markers, hand them to the emitter, then forget them.
    fn emit_committed_states(&mut self) -> Result<()> {
        let promoted = self.tracker.mark_all_pending_as_committed()?;
        let committed = self.tracker.list_committed()?;
        for marker in &committed {
            self.emitter.emit(marker);
        }
        self.tracker.clear_committed()?;
        if promoted > 0 || !committed.is_empty() {
            tracing::debug!(emitted = committed.len(), "Emitted committed checkpoints");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("limits", &self.limits)
            .field("buffers", &self.buffers.len())
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}
