//! Memory-bounded per-stream FIFO used by the concurrent ingress path.
//!
//! A [`StreamAwareQueue`] holds serialized records up to a byte ceiling.
//! The ceiling starts at one allocation chunk and grows as the ingress path
//! obtains more memory; draining shrinks it again so the memory can go back
//! to the shared budget.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use bytes::Bytes;
use bytespool_types::{CheckpointId, StreamDescriptor};

use crate::errors::{BufferError, Result};

/// One record waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub payload: Bytes,
    /// Accounted size; usually `payload.len()`.
    pub size_bytes: u64,
    /// Checkpoint that will cover this record.
    pub checkpoint: CheckpointId,
}

#[derive(Debug)]
struct QueueInner {
    records: VecDeque<QueuedRecord>,
    current_bytes: u64,
    max_bytes: u64,
    last_message: Option<Instant>,
    closed: bool,
}

/// FIFO of one stream's records with a growable byte ceiling.
#[derive(Debug)]
pub struct StreamAwareQueue {
    stream: StreamDescriptor,
    inner: Mutex<QueueInner>,
}

impl StreamAwareQueue {
    #[must_use]
    pub fn new(stream: StreamDescriptor, max_bytes: u64) -> Self {
        Self {
            stream,
            inner: Mutex::new(QueueInner {
                records: VecDeque::new(),
                current_bytes: 0,
                max_bytes,
                last_message: None,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|_| BufferError::LockPoisoned("stream queue"))
    }

    #[must_use]
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Append a record if it fits under the current ceiling. Never blocks.
    ///
    /// Returns `false` when the ceiling would be exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::QueueClosed`] once the queue is closed.
    pub fn offer(&self, payload: &Bytes, size_bytes: u64, checkpoint: CheckpointId) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(BufferError::QueueClosed(self.stream.clone()));
        }
        if inner.current_bytes + size_bytes > inner.max_bytes {
            return Ok(false);
        }
        inner.current_bytes += size_bytes;
        inner.last_message = Some(Instant::now());
        inner.records.push_back(QueuedRecord {
            payload: payload.clone(),
            size_bytes,
            checkpoint,
        });
        Ok(true)
    }

    /// Raise the ceiling by `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn add_max_memory(&self, bytes: u64) -> Result<()> {
        let mut inner = self.lock()?;
        inner.max_bytes += bytes;
        Ok(())
    }

    /// Lower the ceiling by up to `bytes`, never below the queued bytes.
    /// Returns how much it actually dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn shrink_max_memory(&self, bytes: u64) -> Result<u64> {
        let mut inner = self.lock()?;
        let spare = inner.max_bytes.saturating_sub(inner.current_bytes);
        let shrunk = bytes.min(spare);
        inner.max_bytes -= shrunk;
        Ok(shrunk)
    }

    /// Pop records from the head until the next one would push the batch
    /// past `max_bytes`. At least one record is returned if any is queued.
    ///
    /// The ceiling shrinks by the bytes taken.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn take(&self, max_bytes: u64) -> Result<(Vec<QueuedRecord>, u64)> {
        let mut inner = self.lock()?;
        let mut taken = Vec::new();
        let mut bytes = 0u64;
        while let Some(next) = inner.records.front() {
            if !taken.is_empty() && bytes + next.size_bytes > max_bytes {
                break;
            }
            bytes += next.size_bytes;
            if let Some(record) = inner.records.pop_front() {
                taken.push(record);
            }
        }
        inner.current_bytes -= bytes;
        inner.max_bytes = inner.max_bytes.saturating_sub(bytes);
        Ok((taken, bytes))
    }

    /// Put records back at the head, in their original order, and restore
    /// the ceiling they occupied.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn restore_front(&self, records: Vec<QueuedRecord>) -> Result<()> {
        let mut inner = self.lock()?;
        let bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        for record in records.into_iter().rev() {
            inner.records.push_front(record);
        }
        inner.current_bytes += bytes;
        inner.max_bytes += bytes;
        Ok(())
    }

    /// Stop accepting records. Already queued records can still be taken.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn close(&self) -> Result<()> {
        self.lock()?.closed = true;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn current_bytes(&self) -> Result<u64> {
        Ok(self.lock()?.current_bytes)
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn max_bytes(&self) -> Result<u64> {
        Ok(self.lock()?.max_bytes)
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.records.is_empty())
    }

    /// When the last record was offered successfully.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the queue lock is poisoned.
    pub fn time_of_last_message(&self) -> Result<Option<Instant>> {
        Ok(self.lock()?.last_message)
    }
}

/// Concurrent map from stream to its queue.
#[derive(Debug, Default)]
pub struct StreamQueues {
    queues: RwLock<HashMap<StreamDescriptor, Arc<StreamAwareQueue>>>,
}

impl StreamQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `stream`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the map lock is poisoned.
    pub fn get(&self, stream: &StreamDescriptor) -> Result<Option<Arc<StreamAwareQueue>>> {
        let queues = self
            .queues
            .read()
            .map_err(|_| BufferError::LockPoisoned("stream queue map"))?;
        Ok(queues.get(stream).cloned())
    }

    /// Queue for `stream`, creating it with a ceiling of `initial_bytes()`
    /// if absent. `initial_bytes` runs at most once per stream.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the map lock is poisoned.
    pub fn get_or_create(
        &self,
        stream: &StreamDescriptor,
        initial_bytes: impl FnOnce() -> u64,
    ) -> Result<Arc<StreamAwareQueue>> {
        if let Some(queue) = self.get(stream)? {
            return Ok(queue);
        }
        let mut queues = self
            .queues
            .write()
            .map_err(|_| BufferError::LockPoisoned("stream queue map"))?;
        let queue = queues.entry(stream.clone()).or_insert_with(|| {
            let max_bytes = initial_bytes();
            tracing::info!(stream = %stream, max_bytes, "Created queue for stream");
            Arc::new(StreamAwareQueue::new(stream.clone(), max_bytes))
        });
        Ok(Arc::clone(queue))
    }

    /// Every stream that has a queue, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the map lock is poisoned.
    pub fn streams(&self) -> Result<Vec<StreamDescriptor>> {
        let queues = self
            .queues
            .read()
            .map_err(|_| BufferError::LockPoisoned("stream queue map"))?;
        Ok(queues.keys().cloned().collect())
    }

    /// Snapshot of every queue.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if the map lock is poisoned.
    pub fn all(&self) -> Result<Vec<Arc<StreamAwareQueue>>> {
        let queues = self
            .queues
            .read()
            .map_err(|_| BufferError::LockPoisoned("stream queue map"))?;
        Ok(queues.values().cloned().collect())
    }
}
