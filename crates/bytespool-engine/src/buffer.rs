//! Per-stream record accumulation and the collaborator seams around it.
//!
//! The registry never serializes or writes records itself. It asks a
//! [`BufferFactory`] for a [`RecordBuffer`] per stream, appends to it, and
//! hands it to a [`StreamWriter`] when a flush is due. Committed checkpoint
//! markers leave through a [`StateEmitter`].

use bytes::BytesMut;
use bytespool_types::{CheckpointId, CheckpointMarker, ConfiguredCatalog, StreamDescriptor};

/// Accumulator for one stream's pending bytes.
pub trait RecordBuffer: Send {
    /// Append one serialized record, tagged with the checkpoint that will
    /// cover it. Returns the number of bytes the record added.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot take the record.
    fn accept(&mut self, record: &[u8], checkpoint: CheckpointId) -> anyhow::Result<u64>;

    /// Bytes accumulated so far.
    fn byte_count(&self) -> u64;

    /// Records accumulated so far.
    fn record_count(&self) -> u64;

    /// Accumulated bytes, in append order.
    fn contents(&self) -> &[u8];

    /// Release any resources the buffer holds.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing fails; the registry keeps closing the
    /// remaining buffers and reports every failure together.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Creates a buffer the first time a stream is seen.
pub trait BufferFactory: Send {
    /// # Errors
    ///
    /// Returns an error when the destination cannot provide a buffer; this
    /// is fatal for the stream.
    fn create_buffer(
        &mut self,
        stream: &StreamDescriptor,
        catalog: &ConfiguredCatalog,
    ) -> anyhow::Result<Box<dyn RecordBuffer>>;
}

impl<F> BufferFactory for F
where
    F: FnMut(&StreamDescriptor, &ConfiguredCatalog) -> anyhow::Result<Box<dyn RecordBuffer>> + Send,
{
    fn create_buffer(
        &mut self,
        stream: &StreamDescriptor,
        catalog: &ConfiguredCatalog,
    ) -> anyhow::Result<Box<dyn RecordBuffer>> {
        self(stream, catalog)
    }
}

/// Writes a stream's accumulated buffer to the destination.
pub trait StreamWriter: Send {
    /// # Errors
    ///
    /// Returns an error if the write fails. The buffer is left untouched so
    /// a higher level can retry or abort.
    fn write_buffer(
        &mut self,
        stream: &StreamDescriptor,
        buffer: &mut dyn RecordBuffer,
    ) -> anyhow::Result<()>;
}

impl<F> StreamWriter for F
where
    F: FnMut(&StreamDescriptor, &mut dyn RecordBuffer) -> anyhow::Result<()> + Send,
{
    fn write_buffer(
        &mut self,
        stream: &StreamDescriptor,
        buffer: &mut dyn RecordBuffer,
    ) -> anyhow::Result<()> {
        self(stream, buffer)
    }
}

/// Delivers committed markers to the orchestrator. Never fails.
pub trait StateEmitter: Send {
    fn emit(&mut self, marker: &CheckpointMarker);
}

impl<F> StateEmitter for F
where
    F: FnMut(&CheckpointMarker) + Send,
{
    fn emit(&mut self, marker: &CheckpointMarker) {
        self(marker);
    }
}

/// In-memory [`RecordBuffer`] backed by a growable byte buffer.
#[derive(Debug)]
pub struct StreamBuffer {
    stream: StreamDescriptor,
    data: BytesMut,
    record_count: u64,
    /// Run-length encoded checkpoint tag per record, in append order.
    checkpoint_spans: Vec<(CheckpointId, u64)>,
    closed: bool,
}

impl StreamBuffer {
    #[must_use]
    pub fn new(stream: StreamDescriptor) -> Self {
        Self::with_capacity(stream, 0)
    }

    #[must_use]
    pub fn with_capacity(stream: StreamDescriptor, capacity: usize) -> Self {
        Self {
            stream,
            data: BytesMut::with_capacity(capacity),
            record_count: 0,
            checkpoint_spans: Vec::new(),
            closed: false,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Distinct checkpoint ids of the buffered records, oldest first.
    #[must_use]
    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.checkpoint_spans.iter().map(|(id, _)| *id).collect()
    }
}

impl RecordBuffer for StreamBuffer {
    fn accept(&mut self, record: &[u8], checkpoint: CheckpointId) -> anyhow::Result<u64> {
        if self.closed {
            anyhow::bail!("buffer for stream {} is closed", self.stream);
        }
        self.data.extend_from_slice(record);
        self.record_count += 1;
        match self.checkpoint_spans.last_mut() {
            Some((id, n)) if *id == checkpoint => *n += 1,
            _ => self.checkpoint_spans.push((checkpoint, 1)),
        }
        Ok(record.len() as u64)
    }

    fn byte_count(&self) -> u64 {
        self.data.len() as u64
    }

    fn record_count(&self) -> u64 {
        self.record_count
    }

    fn contents(&self) -> &[u8] {
        &self.data
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// [`BufferFactory`] producing [`StreamBuffer`]s with a fixed initial capacity.
///
/// A non-empty catalog restricts the run to the streams it lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryBufferFactory {
    initial_capacity: usize,
}

impl InMemoryBufferFactory {
    #[must_use]
    pub fn new(initial_capacity: usize) -> Self {
        Self { initial_capacity }
    }
}

impl BufferFactory for InMemoryBufferFactory {
    fn create_buffer(
        &mut self,
        stream: &StreamDescriptor,
        catalog: &ConfiguredCatalog,
    ) -> anyhow::Result<Box<dyn RecordBuffer>> {
        if !catalog.streams.is_empty() && catalog.find(stream).is_none() {
            anyhow::bail!("stream {stream} is not in the configured catalog");
        }
        Ok(Box::new(StreamBuffer::with_capacity(
            stream.clone(),
            self.initial_capacity,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytespool_types::ConfiguredStream;

    fn cp(id: u64) -> CheckpointId {
        CheckpointId::new(id)
    }

    #[test]
    fn accept_accumulates_bytes_and_records() {
        let mut buf = StreamBuffer::new(StreamDescriptor::new("users"));
        assert_eq!(buf.accept(b"{\"id\":1}\n", cp(0)).unwrap(), 9);
        assert_eq!(buf.accept(b"{\"id\":2}\n", cp(0)).unwrap(), 9);
        assert_eq!(buf.byte_count(), 18);
        assert_eq!(buf.record_count(), 2);
        assert_eq!(buf.contents(), b"{\"id\":1}\n{\"id\":2}\n");
    }

    #[test]
    fn checkpoint_tags_are_run_length_encoded() {
        let mut buf = StreamBuffer::new(StreamDescriptor::new("users"));
        buf.accept(b"a", cp(0)).unwrap();
        buf.accept(b"b", cp(0)).unwrap();
        buf.accept(b"c", cp(3)).unwrap();
        assert_eq!(buf.checkpoint_ids(), vec![cp(0), cp(3)]);
    }

    #[test]
    fn closed_buffer_rejects_records() {
        let mut buf = StreamBuffer::new(StreamDescriptor::new("users"));
        buf.close().unwrap();
        assert!(buf.accept(b"x", cp(0)).is_err());
    }

    #[test]
    fn factory_only_buffers_catalog_streams() {
        let catalog = ConfiguredCatalog {
            streams: vec![ConfiguredStream {
                stream: StreamDescriptor::with_namespace("public", "users"),
            }],
        };
        let mut factory = InMemoryBufferFactory::new(64);
        assert!(factory
            .create_buffer(&StreamDescriptor::with_namespace("public", "users"), &catalog)
            .is_ok());
        let err = factory
            .create_buffer(&StreamDescriptor::new("orders"), &catalog)
            .err()
            .unwrap();
        assert!(err.to_string().contains("not in the configured catalog"));
        assert!(factory
            .create_buffer(&StreamDescriptor::new("orders"), &ConfiguredCatalog::default())
            .is_ok());
    }

    #[test]
    fn closures_act_as_collaborators() {
        let mut emitted = Vec::new();
        {
            let mut emitter = |m: &CheckpointMarker| emitted.push(m.clone());
            emitter.emit(&CheckpointMarker::global(serde_json::json!({"n": 1})));
        }
        assert_eq!(emitted.len(), 1);

        let mut factory = |s: &StreamDescriptor, _: &ConfiguredCatalog| -> anyhow::Result<Box<dyn RecordBuffer>> {
            Ok(Box::new(StreamBuffer::new(s.clone())))
        };
        let buf = factory
            .create_buffer(&StreamDescriptor::new("x"), &ConfiguredCatalog::default())
            .unwrap();
        assert_eq!(buf.byte_count(), 0);
    }
}
