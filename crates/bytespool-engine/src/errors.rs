//! Engine error types.

use bytespool_types::StreamDescriptor;

/// One buffer that failed to close during a cleanup pass.
#[derive(Debug)]
pub struct CloseFailure {
    pub stream: StreamDescriptor,
    pub error: anyhow::Error,
}

/// Errors produced by the buffering engine.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer factory could not create a buffer for a stream.
    #[error("failed to create buffer for stream {stream}: {source:#}")]
    CreateBuffer {
        stream: StreamDescriptor,
        source: anyhow::Error,
    },

    /// A buffer rejected a record.
    #[error("failed to append record to buffer of stream {stream}: {source:#}")]
    Accept {
        stream: StreamDescriptor,
        source: anyhow::Error,
    },

    /// The destination write failed; the buffer was left in place.
    #[error("failed to write buffer of stream {stream}: {source:#}")]
    Write {
        stream: StreamDescriptor,
        source: anyhow::Error,
    },

    /// One or more buffers failed to close. Every buffer was attempted.
    #[error("errors while closing buffers: {}", join_failures(.failures))]
    Close { failures: Vec<CloseFailure> },

    /// A flush was requested for a stream that has no live buffer.
    #[error("no buffer for stream {0}")]
    UnknownStream(StreamDescriptor),

    /// The stream's queue was closed; no more records are accepted.
    #[error("queue for stream {0} is closed")]
    QueueClosed(StreamDescriptor),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// Limits or sizes that cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {:#}", f.stream, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, BufferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_buffer_displays_stream_and_cause() {
        let err = BufferError::CreateBuffer {
            stream: StreamDescriptor::with_namespace("public", "users"),
            source: anyhow::anyhow!("disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("public.users"), "got: {msg}");
        assert!(msg.contains("disk full"), "got: {msg}");
    }

    #[test]
    fn close_lists_every_failure() {
        let err = BufferError::Close {
            failures: vec![
                CloseFailure {
                    stream: StreamDescriptor::new("a"),
                    error: anyhow::anyhow!("first"),
                },
                CloseFailure {
                    stream: StreamDescriptor::new("b"),
                    error: anyhow::anyhow!("second"),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("a: first"), "got: {msg}");
        assert!(msg.contains("b: second"), "got: {msg}");
    }

    #[test]
    fn write_error_exposes_source() {
        use std::error::Error as _;
        let err = BufferError::Write {
            stream: StreamDescriptor::new("orders"),
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = BufferError::LockPoisoned("checkpoint tracker");
        assert_eq!(err.to_string(), "checkpoint tracker lock poisoned");
    }
}
