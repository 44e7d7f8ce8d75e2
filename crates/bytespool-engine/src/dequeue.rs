//! Consumer-side access to the per-stream queues.
//!
//! Records are taken in batches. A [`MemoryAwareBatch`] keeps its bytes
//! charged to the memory budget until it is dropped, so memory only goes
//! back to producers once the batch has been written (or abandoned).

use std::sync::Arc;
use std::time::Instant;

use bytespool_types::{CheckpointId, StreamDescriptor};

use crate::errors::Result;
use crate::memory::MemoryAllocator;
use crate::queue::{QueuedRecord, StreamQueues};

/// Records taken from one stream's queue.
pub struct MemoryAwareBatch {
    stream: StreamDescriptor,
    records: Vec<QueuedRecord>,
    size_bytes: u64,
    memory: Arc<dyn MemoryAllocator>,
}

impl MemoryAwareBatch {
    #[must_use]
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    #[must_use]
    pub fn records(&self) -> &[QueuedRecord] {
        &self.records
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Distinct checkpoint tags of the batch, in first-seen order.
    #[must_use]
    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        let mut ids: Vec<CheckpointId> = Vec::new();
        for record in &self.records {
            if ids.last() != Some(&record.checkpoint) {
                ids.push(record.checkpoint);
            }
        }
        ids
    }

    /// Hand the records back without freeing their memory.
    fn into_records(mut self) -> Vec<QueuedRecord> {
        self.size_bytes = 0;
        std::mem::take(&mut self.records)
    }
}

impl Drop for MemoryAwareBatch {
    fn drop(&mut self) {
        if self.size_bytes > 0 {
            self.memory.free(self.size_bytes);
        }
    }
}

impl std::fmt::Debug for MemoryAwareBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAwareBatch")
            .field("stream", &self.stream)
            .field("records", &self.records.len())
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// Consumer-side handle onto the per-stream queues. Cheap to clone.
#[derive(Clone)]
pub struct BufferDequeue {
    memory: Arc<dyn MemoryAllocator>,
    queues: Arc<StreamQueues>,
}

impl BufferDequeue {
    #[must_use]
    pub fn new(memory: Arc<dyn MemoryAllocator>, queues: Arc<StreamQueues>) -> Self {
        Self { memory, queues }
    }

    /// Take up to `max_bytes` of records from `stream`, oldest first.
    ///
    /// Returns an empty batch if the stream has no queue or nothing queued.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn take(&self, stream: &StreamDescriptor, max_bytes: u64) -> Result<MemoryAwareBatch> {
        let (records, size_bytes) = match self.queues.get(stream)? {
            Some(queue) => queue.take(max_bytes)?,
            None => (Vec::new(), 0),
        };
        tracing::debug!(stream = %stream, records = records.len(), bytes = size_bytes, "Took batch");
        Ok(MemoryAwareBatch {
            stream: stream.clone(),
            records,
            size_bytes,
            memory: Arc::clone(&self.memory),
        })
    }

    /// Return an unwritten batch to the head of its queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn restore(&self, batch: MemoryAwareBatch) -> Result<()> {
        let stream = batch.stream.clone();
        let records = batch.into_records();
        if let Some(queue) = self.queues.get(&stream)? {
            queue.restore_front(records)?;
        }
        Ok(())
    }

    /// Every stream that has a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn streams(&self) -> Result<Vec<StreamDescriptor>> {
        self.queues.streams()
    }

    /// Bytes queued for `stream`, `None` if it has no queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn queue_size_bytes(&self, stream: &StreamDescriptor) -> Result<Option<u64>> {
        self.queues
            .get(stream)?
            .map(|q| q.current_bytes())
            .transpose()
    }

    /// Records queued for `stream`, `None` if it has no queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn queue_len(&self, stream: &StreamDescriptor) -> Result<Option<usize>> {
        self.queues.get(stream)?.map(|q| q.len()).transpose()
    }

    /// When `stream` last received a record.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn time_of_last_record(&self, stream: &StreamDescriptor) -> Result<Option<Instant>> {
        Ok(self
            .queues
            .get(stream)?
            .map(|q| q.time_of_last_message())
            .transpose()?
            .flatten())
    }

    /// Bytes queued across every stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn total_queued_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for queue in self.queues.all()? {
            total += queue.current_bytes()?;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for BufferDequeue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDequeue").finish_non_exhaustive()
    }
}
