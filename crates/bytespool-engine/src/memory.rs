//! Process-wide memory budget.
//!
//! [`MemoryManager`] hands out fixed-size chunks of a total byte budget to
//! per-stream buffers and takes them back on flush. Requests never block:
//! an exhausted budget answers with a zero grant and the caller decides
//! whether to retry, back off, or flush.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{BufferError, Result};

/// 10 MiB default allocation chunk.
pub const DEFAULT_CHUNK_BYTES: u64 = 10 * 1024 * 1024;

/// Contract for granting and reclaiming buffer memory.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn MemoryAllocator>`.
pub trait MemoryAllocator: Send + Sync {
    /// Grant one allocation chunk. Returns `0` when the budget is exhausted.
    fn request_memory(&self) -> u64;

    /// Return previously granted bytes to the pool.
    fn free(&self, bytes: u64);

    /// Bytes currently granted and not yet freed.
    fn current_memory_bytes(&self) -> u64;

    /// Configured ceiling.
    fn max_memory_bytes(&self) -> u64;
}

/// Lock-free chunked allocator over a fixed budget.
#[derive(Debug)]
pub struct MemoryManager {
    max_memory_bytes: u64,
    chunk_bytes: u64,
    current_memory_bytes: AtomicU64,
}

impl MemoryManager {
    /// Create an allocator over `max_memory_bytes`, granting `chunk_bytes` per request.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Config`] if either size is zero.
    pub fn new(max_memory_bytes: u64, chunk_bytes: u64) -> Result<Self> {
        if max_memory_bytes == 0 {
            return Err(BufferError::Config("memory budget must be > 0".into()));
        }
        if chunk_bytes == 0 {
            return Err(BufferError::Config("allocation chunk must be > 0".into()));
        }
        Ok(Self {
            max_memory_bytes,
            chunk_bytes,
            current_memory_bytes: AtomicU64::new(0),
        })
    }

    /// Allocator with the default chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Config`] if `max_memory_bytes` is zero.
    pub fn with_budget(max_memory_bytes: u64) -> Result<Self> {
        Self::new(max_memory_bytes, DEFAULT_CHUNK_BYTES)
    }

    #[must_use]
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_bytes
    }

    /// Bytes that can still be granted.
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.max_memory_bytes
            .saturating_sub(self.current_memory_bytes.load(Ordering::Acquire))
    }
}

impl MemoryAllocator for MemoryManager {
    fn request_memory(&self) -> u64 {
        let mut current = self.current_memory_bytes.load(Ordering::Acquire);
        loop {
            if current >= self.max_memory_bytes {
                return 0;
            }
            // The final grant may be short so outstanding never exceeds the budget.
            let grant = self.chunk_bytes.min(self.max_memory_bytes - current);
            match self.current_memory_bytes.compare_exchange_weak(
                current,
                current + grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(
                        granted = grant,
                        outstanding = current + grant,
                        max = self.max_memory_bytes,
                        "Granted buffer memory"
                    );
                    return grant;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn free(&self, bytes: u64) {
        let mut current = self.current_memory_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.current_memory_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if bytes > current {
                        tracing::warn!(
                            freed = bytes,
                            outstanding = current,
                            "Freed more memory than was allocated, clamping to zero"
                        );
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn current_memory_bytes(&self) -> u64 {
        self.current_memory_bytes.load(Ordering::Acquire)
    }

    fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }
}
