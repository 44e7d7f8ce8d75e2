//! Directory-backed destination: every flushed buffer or drained batch
//! becomes one JSON-lines file under `<root>/<stream>/`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytespool_engine::{BatchWriter, MemoryAwareBatch, RecordBuffer, StreamWriter};
use bytespool_types::StreamDescriptor;

/// Counters shared between a writer and whoever reports on the run.
#[derive(Debug, Default)]
pub struct WriteStats {
    pub files: AtomicU64,
    pub records: AtomicU64,
    pub bytes: AtomicU64,
}

#[derive(Debug)]
pub struct DirectoryWriter {
    root: PathBuf,
    stats: Arc<WriteStats>,
}

impl DirectoryWriter {
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created.
    pub fn new(root: &Path, stats: Arc<WriteStats>) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create output directory: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            stats,
        })
    }

    fn write_file(&self, stream: &StreamDescriptor, records: u64, parts: &[&[u8]]) -> Result<()> {
        let dir = self.root.join(stream.to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create stream directory: {}", dir.display()))?;
        let seq = self.stats.files.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("{seq:06}.jsonl"));

        let bytes = parts.concat();
        std::fs::write(&path, &bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        self.stats.records.fetch_add(records, Ordering::SeqCst);
        self.stats.bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        tracing::debug!(stream = %stream, path = %path.display(), records, "Wrote buffer file");
        Ok(())
    }
}

impl StreamWriter for DirectoryWriter {
    fn write_buffer(
        &mut self,
        stream: &StreamDescriptor,
        buffer: &mut dyn RecordBuffer,
    ) -> anyhow::Result<()> {
        if buffer.record_count() == 0 {
            return Ok(());
        }
        self.write_file(stream, buffer.record_count(), &[buffer.contents()])
    }
}

impl BatchWriter for DirectoryWriter {
    fn write_batch(&mut self, batch: &MemoryAwareBatch) -> anyhow::Result<()> {
        let parts: Vec<&[u8]> = batch.records().iter().map(|r| r.payload.as_ref()).collect();
        self.write_file(batch.stream(), batch.len() as u64, &parts)
    }
}
