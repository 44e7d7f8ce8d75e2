//! Concurrent ingress path.
//!
//! [`BufferEnqueue`] is called once per incoming message, possibly from
//! several producer threads. State messages go straight to the checkpoint
//! tracker; records go to their stream's queue, with backpressure when the
//! memory budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytespool_types::{CheckpointMarker, IncomingMessage, StreamDescriptor};

use crate::checkpoint::CheckpointTracker;
use crate::errors::Result;
use crate::memory::MemoryAllocator;
use crate::queue::StreamQueues;

/// How a producer waits when its stream's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    /// Failed offers tolerated before sleeping between attempts.
    pub retries_before_sleep: u32,
    /// Sleep between attempts once the retries are used up.
    pub sleep: Duration,
}

impl BackpressurePolicy {
    pub const DEFAULT_RETRIES_BEFORE_SLEEP: u32 = 5;
    pub const DEFAULT_SLEEP: Duration = Duration::from_millis(500);
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            retries_before_sleep: Self::DEFAULT_RETRIES_BEFORE_SLEEP,
            sleep: Self::DEFAULT_SLEEP,
        }
    }
}

/// Producer-side handle onto the per-stream queues. Cheap to clone.
#[derive(Clone)]
pub struct BufferEnqueue {
    memory: Arc<dyn MemoryAllocator>,
    queues: Arc<StreamQueues>,
    tracker: Arc<CheckpointTracker>,
    policy: BackpressurePolicy,
}

impl BufferEnqueue {
    #[must_use]
    pub fn new(
        memory: Arc<dyn MemoryAllocator>,
        queues: Arc<StreamQueues>,
        tracker: Arc<CheckpointTracker>,
        policy: BackpressurePolicy,
    ) -> Self {
        Self {
            memory,
            queues,
            tracker,
            policy,
        }
    }

    /// Route one incoming message. `serialized` is its wire form; its length
    /// is the size accounted against the memory budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream's queue is closed or a lock is poisoned.
    pub fn add_message(&self, message: IncomingMessage, serialized: Bytes) -> Result<()> {
        let size = serialized.len() as u64;
        match message {
            IncomingMessage::Record { record } => {
                self.add_record(&record.descriptor(), serialized, size)
            }
            IncomingMessage::State { state } => self.add_state(state, size),
        }
    }

    /// Register a checkpoint marker. No queue placement.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`](crate::errors::BufferError::LockPoisoned)
    /// if the tracker lock is poisoned.
    pub fn add_state(&self, marker: CheckpointMarker, size_hint: u64) -> Result<()> {
        self.tracker.track_checkpoint(marker, size_hint)?;
        Ok(())
    }

    /// Enqueue one record, blocking the calling thread until it fits.
    ///
    /// Each failed offer requests another allocation chunk and grows the
    /// queue's ceiling if one was granted. After
    /// [`retries_before_sleep`](BackpressurePolicy::retries_before_sleep)
    /// failed attempts, every further attempt is preceded by a sleep. The
    /// loop never gives up; a caller that needs a deadline must enforce it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream's queue is closed or a lock is poisoned.
    pub fn add_record(&self, stream: &StreamDescriptor, payload: Bytes, size_bytes: u64) -> Result<()> {
        let queue = self
            .queues
            .get_or_create(stream, || self.memory.request_memory())?;
        let checkpoint = self.tracker.record_arrived(stream)?;

        let mut added = queue.offer(&payload, size_bytes, checkpoint)?;
        let mut attempts: u32 = 0;
        while !added {
            let granted = self.memory.request_memory();
            if granted > 0 {
                queue.add_max_memory(granted)?;
            }
            added = queue.offer(&payload, size_bytes, checkpoint)?;
            attempts = attempts.saturating_add(1);
            if !added && attempts > self.policy.retries_before_sleep {
                if attempts == self.policy.retries_before_sleep + 1 {
                    tracing::warn!(
                        stream = %stream,
                        record_bytes = size_bytes,
                        outstanding = self.memory.current_memory_bytes(),
                        max = self.memory.max_memory_bytes(),
                        "Memory budget exhausted, applying backpressure"
                    );
                }
                std::thread::sleep(self.policy.sleep);
            }
        }
        if attempts > self.policy.retries_before_sleep {
            tracing::info!(stream = %stream, attempts, "Record enqueued after backpressure");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferEnqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferEnqueue")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::queue::StreamAwareQueue;
    use bytespool_types::RecordMessage;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Refuses the first `refusals` requests, then grants `chunk` each time.
    struct StingyAllocator {
        refusals: u64,
        chunk: u64,
        requests: AtomicU64,
        outstanding: AtomicU64,
    }

    impl MemoryAllocator for StingyAllocator {
        fn request_memory(&self) -> u64 {
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            if n < self.refusals {
                0
            } else {
                self.outstanding.fetch_add(self.chunk, Ordering::SeqCst);
                self.chunk
            }
        }
        fn free(&self, bytes: u64) {
            self.outstanding.fetch_sub(bytes, Ordering::SeqCst);
        }
        fn current_memory_bytes(&self) -> u64 {
            self.outstanding.load(Ordering::SeqCst)
        }
        fn max_memory_bytes(&self) -> u64 {
            u64::MAX
        }
    }

    fn fast_policy() -> BackpressurePolicy {
        BackpressurePolicy {
            retries_before_sleep: 2,
            sleep: Duration::from_millis(1),
        }
    }

    fn enqueue_with(memory: Arc<dyn MemoryAllocator>) -> (BufferEnqueue, Arc<StreamQueues>, Arc<CheckpointTracker>) {
        let queues = Arc::new(StreamQueues::new());
        let tracker = Arc::new(CheckpointTracker::new());
        let enqueue = BufferEnqueue::new(memory, Arc::clone(&queues), Arc::clone(&tracker), fast_policy());
        (enqueue, queues, tracker)
    }

    fn queue_of(queues: &StreamQueues, stream: &StreamDescriptor) -> Arc<StreamAwareQueue> {
        queues.get(stream).unwrap().unwrap()
    }

    #[test]
    fn record_lands_in_its_stream_queue() {
        let memory = Arc::new(MemoryManager::new(1_000, 100).unwrap());
        let (enqueue, queues, _) = enqueue_with(memory.clone());
        let msg = IncomingMessage::Record {
            record: RecordMessage {
                namespace: Some("public".into()),
                stream: "users".into(),
                data: serde_json::json!({"id": 1}),
                emitted_at: None,
            },
        };
        enqueue.add_message(msg, Bytes::from_static(b"0123456789")).unwrap();

        let q = queue_of(&queues, &StreamDescriptor::with_namespace("public", "users"));
        assert_eq!(q.len().unwrap(), 1);
        assert_eq!(q.current_bytes().unwrap(), 10);
        assert_eq!(memory.current_memory_bytes(), 100);
    }

    #[test]
    fn state_goes_to_tracker_only() {
        let memory = Arc::new(MemoryManager::new(1_000, 100).unwrap());
        let (enqueue, queues, tracker) = enqueue_with(memory);
        let msg = IncomingMessage::State {
            state: CheckpointMarker::global(serde_json::json!({"n": 1})),
        };
        enqueue.add_message(msg, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(tracker.pending_count().unwrap(), 1);
        assert_eq!(tracker.memory_bytes().unwrap(), 3);
        assert!(queues.streams().unwrap().is_empty());
    }

    #[test]
    fn full_queue_grows_by_requesting_more_memory() {
        let memory = Arc::new(MemoryManager::new(1_000, 10).unwrap());
        let (enqueue, queues, _) = enqueue_with(memory.clone());
        let s = StreamDescriptor::new("s");
        for _ in 0..5 {
            enqueue.add_record(&s, Bytes::from(vec![0; 8]), 8).unwrap();
        }
        let q = queue_of(&queues, &s);
        assert_eq!(q.len().unwrap(), 5);
        assert_eq!(q.current_bytes().unwrap(), 40);
        assert!(q.max_bytes().unwrap() >= 40);
        assert_eq!(memory.current_memory_bytes(), q.max_bytes().unwrap());
    }

    #[test]
    fn exhausted_budget_retries_until_granted() {
        let allocator = Arc::new(StingyAllocator {
            refusals: 12,
            chunk: 64,
            requests: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
        });
        let (enqueue, queues, _) = enqueue_with(allocator.clone());
        let s = StreamDescriptor::new("s");
        enqueue.add_record(&s, Bytes::from(vec![0; 32]), 32).unwrap();

        // Initial allocation plus every retry were refused before the grant.
        assert_eq!(allocator.requests.load(Ordering::SeqCst), 13);
        assert_eq!(queue_of(&queues, &s).len().unwrap(), 1);
    }

    #[test]
    fn record_is_tagged_with_open_checkpoint() {
        let memory = Arc::new(MemoryManager::new(1_000, 100).unwrap());
        let (enqueue, queues, tracker) = enqueue_with(memory);
        let s = StreamDescriptor::new("s");
        enqueue.add_record(&s, Bytes::from_static(b"a"), 1).unwrap();
        let id = tracker
            .track_checkpoint(CheckpointMarker::stream(s.clone(), serde_json::Value::Null), 1)
            .unwrap();
        let (batch, _) = queue_of(&queues, &s).take(100).unwrap();
        assert_eq!(batch[0].checkpoint, id);
    }
}
