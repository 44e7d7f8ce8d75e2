//! Checkpoint lifecycle tracking.
//!
//! Markers move `Pending` -> `Committed` -> emitted/discarded. A marker is
//! committed only when a flush completes, listed for emission in receipt
//! order, and dropped by [`CheckpointTracker::clear_committed`].
//!
//! Every operation takes the single internal lock once, so each call is
//! atomic. Sequences spanning calls (list, emit, clear) are the caller's to
//! serialize.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use bytespool_types::{CheckpointId, CheckpointMarker, CheckpointScope, StreamDescriptor};

use crate::errors::{BufferError, Result};

/// Where a tracked marker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Received; the records it covers may not be durable yet.
    Pending,
    /// Every flush it waited on has completed; ready to emit.
    Committed,
}

/// A marker plus the bookkeeping the tracker keeps for it.
#[derive(Debug, Clone)]
pub struct TrackedCheckpoint {
    pub id: CheckpointId,
    /// Receipt order across all streams, starting at 1.
    pub sequence: u64,
    pub marker: CheckpointMarker,
    /// Records enqueued for this marker's scope since the previous marker of that scope.
    pub records_covered: u64,
    pub size_hint: u64,
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone, Copy)]
struct OpenCheckpoint {
    id: CheckpointId,
    records: u64,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_id: u64,
    next_sequence: u64,
    open: HashMap<StreamDescriptor, OpenCheckpoint>,
    records_since_global: u64,
    pending: VecDeque<TrackedCheckpoint>,
    committed: VecDeque<TrackedCheckpoint>,
    memory_bytes: u64,
    last_tracked: Option<CheckpointId>,
}

impl TrackerInner {
    fn allocate_id(&mut self) -> CheckpointId {
        let id = CheckpointId::new(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Tracks checkpoint markers from receipt to emission.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    inner: Mutex<TrackerInner>,
}

impl CheckpointTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrackerInner>> {
        self.inner
            .lock()
            .map_err(|_| BufferError::LockPoisoned("checkpoint tracker"))
    }

    /// Count a record against the open checkpoint of its stream.
    ///
    /// Returns the id of the checkpoint that will cover the record once it
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn record_arrived(&self, stream: &StreamDescriptor) -> Result<CheckpointId> {
        let mut inner = self.lock()?;
        inner.records_since_global += 1;
        if let Some(open) = inner.open.get_mut(stream) {
            open.records += 1;
            return Ok(open.id);
        }
        let id = inner.allocate_id();
        inner
            .open
            .insert(stream.clone(), OpenCheckpoint { id, records: 1 });
        Ok(id)
    }

    /// Undo one [`record_arrived`](Self::record_arrived) for a record that
    /// never made it into a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn record_rejected(&self, stream: &StreamDescriptor) -> Result<()> {
        let mut inner = self.lock()?;
        inner.records_since_global = inner.records_since_global.saturating_sub(1);
        if let Some(open) = inner.open.get_mut(stream) {
            open.records = open.records.saturating_sub(1);
        }
        Ok(())
    }

    /// Register a received marker as pending.
    ///
    /// A stream marker closes its stream's open checkpoint; a global marker
    /// closes every open checkpoint. `size_hint` is the serialized size of
    /// the marker and is held in [`memory_bytes`](Self::memory_bytes) until
    /// the marker is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn track_checkpoint(&self, marker: CheckpointMarker, size_hint: u64) -> Result<CheckpointId> {
        let mut inner = self.lock()?;
        let (id, records_covered) = match &marker.scope {
            CheckpointScope::Stream { stream } => match inner.open.remove(stream) {
                Some(open) => (open.id, open.records),
                None => (inner.allocate_id(), 0),
            },
            CheckpointScope::Global => {
                inner.open.clear();
                let covered = std::mem::take(&mut inner.records_since_global);
                (inner.allocate_id(), covered)
            }
        };
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.memory_bytes += size_hint;
        inner.last_tracked = Some(id);
        tracing::debug!(
            checkpoint = %id,
            sequence,
            records = records_covered,
            stream = ?marker.scope.stream().map(ToString::to_string),
            "Tracked checkpoint"
        );
        inner.pending.push_back(TrackedCheckpoint {
            id,
            sequence,
            marker,
            records_covered,
            size_hint,
            status: CheckpointStatus::Pending,
        });
        Ok(id)
    }

    /// Id of the most recently tracked marker.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn last_tracked_id(&self) -> Result<Option<CheckpointId>> {
        Ok(self.lock()?.last_tracked)
    }

    /// Receipt sequence of the most recently tracked marker (0 if none).
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn watermark(&self) -> Result<u64> {
        Ok(self.lock()?.next_sequence)
    }

    /// Move every pending marker to committed. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn mark_all_pending_as_committed(&self) -> Result<usize> {
        self.mark_pending_as_committed_through(u64::MAX)
    }

    /// Move pending markers received at or before `watermark` to committed.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn mark_pending_as_committed_through(&self, watermark: u64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut moved = 0;
        while inner
            .pending
            .front()
            .is_some_and(|cp| cp.sequence <= watermark)
        {
            if let Some(mut cp) = inner.pending.pop_front() {
                cp.status = CheckpointStatus::Committed;
                inner.committed.push_back(cp);
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Committed markers in receipt order. Does not change state.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn list_committed(&self) -> Result<Vec<CheckpointMarker>> {
        Ok(self
            .lock()?
            .committed
            .iter()
            .map(|cp| cp.marker.clone())
            .collect())
    }

    /// Drop every committed marker. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn clear_committed(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let freed: u64 = inner.committed.iter().map(|cp| cp.size_hint).sum();
        inner.memory_bytes = inner.memory_bytes.saturating_sub(freed);
        let cleared = inner.committed.len();
        inner.committed.clear();
        Ok(cleared)
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn committed_count(&self) -> Result<usize> {
        Ok(self.lock()?.committed.len())
    }

    /// Size hints of every marker not yet cleared.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn memory_bytes(&self) -> Result<u64> {
        Ok(self.lock()?.memory_bytes)
    }

    /// Copy of the pending markers with their bookkeeping, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LockPoisoned`] if a thread panicked while holding the lock.
    pub fn pending(&self) -> Result<Vec<TrackedCheckpoint>> {
        Ok(self.lock()?.pending.iter().cloned().collect())
    }
}
