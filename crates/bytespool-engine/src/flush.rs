//! Consumer-side flushing for the concurrent mode.
//!
//! [`AsyncFlusher`] drains queues through a [`BatchWriter`] and then runs
//! the same promote -> emit -> clear sequence as the synchronous registry.
//! Only markers received before the flush started are promoted. As in the
//! synchronous path, a single-stream flush promotes markers of other
//! streams too; a full flush is what guarantees every promoted marker's
//! records are durable.
//!
//! Flushes on one flusher run one at a time. The writer lock is held from
//! the watermark read until the emit, so a marker is never emitted while
//! another flush still has its records in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use bytespool_types::StreamDescriptor;

use crate::buffer::StateEmitter;
use crate::checkpoint::CheckpointTracker;
use crate::dequeue::{BufferDequeue, MemoryAwareBatch};
use crate::errors::{BufferError, Result};

/// Writes a drained batch to the destination.
pub trait BatchWriter: Send {
    /// # Errors
    ///
    /// Returns an error if the write fails; the batch is put back at the
    /// head of its queue.
    fn write_batch(&mut self, batch: &MemoryAwareBatch) -> anyhow::Result<()>;
}

impl<F> BatchWriter for F
where
    F: FnMut(&MemoryAwareBatch) -> anyhow::Result<()> + Send,
{
    fn write_batch(&mut self, batch: &MemoryAwareBatch) -> anyhow::Result<()> {
        self(batch)
    }
}

/// What a flush accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub records_written: u64,
    pub bytes_written: u64,
    pub batches_written: u64,
    pub checkpoints_emitted: usize,
}

/// Drains queues and emits checkpoints once their data is written.
pub struct AsyncFlusher {
    dequeue: BufferDequeue,
    tracker: Arc<CheckpointTracker>,
    writer: Mutex<Box<dyn BatchWriter>>,
    emitter: Mutex<Box<dyn StateEmitter>>,
    max_batch_bytes: u64,
}

impl AsyncFlusher {
    #[must_use]
    pub fn new(
        dequeue: BufferDequeue,
        tracker: Arc<CheckpointTracker>,
        writer: impl BatchWriter + 'static,
        emitter: impl StateEmitter + 'static,
        max_batch_bytes: u64,
    ) -> Self {
        Self {
            dequeue,
            tracker,
            writer: Mutex::new(Box::new(writer)),
            emitter: Mutex::new(Box::new(emitter)),
            max_batch_bytes: max_batch_bytes.max(1),
        }
    }

    /// Write at most one batch of `stream`, then emit committed markers.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Write`] if the write fails; the records are
    /// back in the queue and no marker is promoted.
    pub fn flush_stream(&self, stream: &StreamDescriptor) -> Result<FlushOutcome> {
        let mut writer = self.lock_writer()?;
        let watermark = self.tracker.watermark()?;
        let mut outcome = FlushOutcome::default();
        self.write_one(&mut **writer, stream, &mut outcome)?;
        if outcome.batches_written > 0 {
            outcome.checkpoints_emitted = self.emit_committed_through(watermark)?;
        }
        Ok(outcome)
    }

    /// Write everything queued when the call started, across every stream,
    /// then emit every marker received before the call.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Write`] on the first failed write; the failed
    /// batch is back in its queue and no marker is promoted.
    pub fn flush_all(&self) -> Result<FlushOutcome> {
        let mut writer = self.lock_writer()?;
        let watermark = self.tracker.watermark()?;
        let mut outcome = FlushOutcome::default();
        for stream in self.dequeue.streams()? {
            let mut remaining = self.dequeue.queue_size_bytes(&stream)?.unwrap_or(0);
            tracing::info!(stream = %stream, bytes = remaining, "Flushing queue of stream");
            while remaining > 0 {
                let written = self.write_one(&mut **writer, &stream, &mut outcome)?;
                if written == 0 {
                    break;
                }
                remaining = remaining.saturating_sub(written);
            }
        }
        outcome.checkpoints_emitted = self.emit_committed_through(watermark)?;
        tracing::info!(
            records = outcome.records_written,
            bytes = outcome.bytes_written,
            checkpoints = outcome.checkpoints_emitted,
            "Flushed all queues"
        );
        Ok(outcome)
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Box<dyn BatchWriter>>> {
        self.writer
            .lock()
            .map_err(|_| BufferError::LockPoisoned("batch writer"))
    }

    /// Returns the bytes written.
    fn write_one(
        &self,
        writer: &mut dyn BatchWriter,
        stream: &StreamDescriptor,
        outcome: &mut FlushOutcome,
    ) -> Result<u64> {
        let batch = self.dequeue.take(stream, self.max_batch_bytes)?;
        if batch.is_empty() {
            return Ok(0);
        }
        if let Err(source) = writer.write_batch(&batch) {
            tracing::error!(stream = %stream, bytes = batch.size_bytes(), "Batch write failed: {source:#}");
            self.dequeue.restore(batch)?;
            return Err(BufferError::Write {
                stream: stream.clone(),
                source,
            });
        }
        let bytes = batch.size_bytes();
        outcome.records_written += batch.len() as u64;
        outcome.bytes_written += bytes;
        outcome.batches_written += 1;
        Ok(bytes)
    }

    fn emit_committed_through(&self, watermark: u64) -> Result<usize> {
        // Holding the emitter serializes promote, list, emit, and clear.
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| BufferError::LockPoisoned("state emitter"))?;
        self.tracker.mark_pending_as_committed_through(watermark)?;
        let committed = self.tracker.list_committed()?;
        for marker in &committed {
            emitter.emit(marker);
        }
        self.tracker.clear_committed()?;
        Ok(committed.len())
    }
}

impl std::fmt::Debug for AsyncFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFlusher")
            .field("max_batch_bytes", &self.max_batch_bytes)
            .finish_non_exhaustive()
    }
}
