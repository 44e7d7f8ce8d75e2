//! Per-run owner of the concurrent-mode state.

use std::sync::Arc;

use crate::checkpoint::CheckpointTracker;
use crate::dequeue::BufferDequeue;
use crate::enqueue::{BackpressurePolicy, BufferEnqueue};
use crate::errors::Result;
use crate::memory::MemoryAllocator;
use crate::queue::StreamQueues;

/// Owns the allocator, tracker, and queue map for one run and hands out
/// producer and consumer handles over them.
pub struct BufferManager {
    memory: Arc<dyn MemoryAllocator>,
    queues: Arc<StreamQueues>,
    tracker: Arc<CheckpointTracker>,
    policy: BackpressurePolicy,
}

impl BufferManager {
    #[must_use]
    pub fn new(memory: Arc<dyn MemoryAllocator>, policy: BackpressurePolicy) -> Self {
        Self {
            memory,
            queues: Arc::new(StreamQueues::new()),
            tracker: Arc::new(CheckpointTracker::new()),
            policy,
        }
    }

    /// Producer handle. Cheap to clone into each producer thread.
    #[must_use]
    pub fn enqueue(&self) -> BufferEnqueue {
        BufferEnqueue::new(
            Arc::clone(&self.memory),
            Arc::clone(&self.queues),
            Arc::clone(&self.tracker),
            self.policy,
        )
    }

    /// Consumer handle.
    #[must_use]
    pub fn dequeue(&self) -> BufferDequeue {
        BufferDequeue::new(Arc::clone(&self.memory), Arc::clone(&self.queues))
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<CheckpointTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<dyn MemoryAllocator> {
        &self.memory
    }

    #[must_use]
    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Close every queue to producers and release the unused headroom of
    /// empty queues. Returns `true` if every queue was empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn close(&self) -> Result<bool> {
        let mut all_empty = true;
        for queue in self.queues.all()? {
            queue.close()?;
            let queued = queue.current_bytes()?;
            if queued == 0 {
                let released = queue.shrink_max_memory(queue.max_bytes()?)?;
                self.memory.free(released);
            } else {
                all_empty = false;
                tracing::warn!(
                    stream = %queue.stream(),
                    bytes = queued,
                    records = queue.len()?,
                    "Queue closed with unflushed records"
                );
            }
        }
        tracing::info!(
            all_empty,
            outstanding = self.memory.current_memory_bytes(),
            pending_checkpoints = self.tracker.pending_count()?,
            "Buffer manager closed"
        );
        Ok(all_empty)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("policy", &self.policy)
            .field("outstanding", &self.memory.current_memory_bytes())
            .finish_non_exhaustive()
    }
}
