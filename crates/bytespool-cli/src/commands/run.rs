use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use bytespool_engine::config::{parser, validator};
use bytespool_engine::{
    AsyncFlusher, BufferManager, BufferRegistry, EngineConfig, InMemoryBufferFactory,
};
use bytespool_types::{CheckpointMarker, ConfiguredCatalog, IncomingMessage, RecordMessage};

use super::check::format_bytes;
use super::destination::{DirectoryWriter, WriteStats};

const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// What a run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub records_read: u64,
    pub states_read: u64,
    pub files_written: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub checkpoints: Vec<CheckpointMarker>,
    pub duration_secs: f64,
}

/// Execute the `run` command: buffer the input file into `output_dir` and
/// print every emitted checkpoint as one JSON line on stdout.
pub fn execute(
    input: &Path,
    output_dir: &Path,
    config_path: Option<&Path>,
    concurrent: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => parser::parse_config(path)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    validator::validate_config(&config)?;

    tracing::info!(
        input = %input.display(),
        output = %output_dir.display(),
        concurrent,
        "Config validated"
    );

    let summary = if concurrent {
        run_concurrent(&config, input, output_dir)?
    } else {
        run_buffered(&config, input, output_dir)?
    };

    for marker in &summary.checkpoints {
        println!("{}", serde_json::to_string(marker)?);
    }
    eprintln!("Run completed.");
    eprintln!("  Records read:    {}", summary.records_read);
    eprintln!("  States read:     {}", summary.states_read);
    eprintln!("  Records written: {}", summary.records_written);
    eprintln!("  Bytes written:   {}", format_bytes(summary.bytes_written));
    eprintln!("  Files written:   {}", summary.files_written);
    eprintln!("  Checkpoints:     {}", summary.checkpoints.len());
    eprintln!("  Duration:        {:.2}s", summary.duration_secs);
    Ok(())
}

/// Read the message file, calling `handle` with each message and its line length.
fn for_each_message(
    input: &Path,
    mut handle: impl FnMut(IncomingMessage, u64) -> Result<()>,
) -> Result<()> {
    let file = std::fs::File::open(input)
        .with_context(|| format!("Failed to open input: {}", input.display()))?;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let message: IncomingMessage = serde_json::from_str(&line)
            .with_context(|| format!("Invalid message on line {}", idx + 1))?;
        handle(message, line.len() as u64)?;
    }
    Ok(())
}

/// One output line per record.
fn encode_record(record: &RecordMessage) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&record.data)?;
    line.push(b'\n');
    Ok(line)
}

/// Synchronous mode: one registry, flushes inline.
pub fn run_buffered(config: &EngineConfig, input: &Path, output_dir: &Path) -> Result<RunSummary> {
    let start = Instant::now();
    let stats = Arc::new(WriteStats::default());
    let emitted: Arc<Mutex<Vec<CheckpointMarker>>> = Arc::default();
    let sink = Arc::clone(&emitted);

    let mut registry = BufferRegistry::new(
        InMemoryBufferFactory::default(),
        DirectoryWriter::new(output_dir, Arc::clone(&stats))?,
        move |marker: &CheckpointMarker| {
            if let Ok(mut markers) = sink.lock() {
                markers.push(marker.clone());
            }
        },
        ConfiguredCatalog::default(),
        config.flush_limits()?,
        Arc::new(config.memory_manager()?),
    )?;

    let mut summary = RunSummary::default();
    let result = for_each_message(input, |message, size| {
        match message {
            IncomingMessage::Record { record } => {
                summary.records_read += 1;
                let payload = encode_record(&record)?;
                if let Some(flush) = registry.add_record(&record.descriptor(), &payload)? {
                    tracing::debug!(?flush, "Record triggered a flush");
                }
            }
            IncomingMessage::State { state } => {
                summary.states_read += 1;
                registry.add_state(state, size)?;
            }
        }
        Ok(())
    })
    .and_then(|()| registry.flush_all_streams().map_err(Into::into));

    if let Err(err) = result {
        if let Err(close_err) = registry.close() {
            tracing::error!("Failed to close buffers after error: {close_err}");
        }
        return Err(err);
    }

    finish(summary, &stats, &emitted, start)
}

/// Concurrent mode: the reader enqueues while a flusher thread drains.
pub fn run_concurrent(config: &EngineConfig, input: &Path, output_dir: &Path) -> Result<RunSummary> {
    let start = Instant::now();
    let stats = Arc::new(WriteStats::default());
    let emitted: Arc<Mutex<Vec<CheckpointMarker>>> = Arc::default();
    let sink = Arc::clone(&emitted);

    let manager = BufferManager::new(
        Arc::new(config.memory_manager()?),
        config.backpressure_policy(),
    );
    let flusher = AsyncFlusher::new(
        manager.dequeue(),
        Arc::clone(manager.tracker()),
        DirectoryWriter::new(output_dir, Arc::clone(&stats))?,
        move |marker: &CheckpointMarker| {
            if let Ok(mut markers) = sink.lock() {
                markers.push(marker.clone());
            }
        },
        config.drain_max_batch_bytes()?,
    );
    let enqueue = manager.enqueue();
    let reading = AtomicBool::new(true);
    let mut summary = RunSummary::default();

    let read_result = std::thread::scope(|scope| {
        let drain = scope.spawn(|| -> Result<()> {
            while reading.load(Ordering::Acquire) {
                if let Err(err) = flusher.flush_all() {
                    // Closed queues fail the reader instead of leaving it in backpressure.
                    manager.close()?;
                    return Err(err.into());
                }
                std::thread::sleep(FLUSH_INTERVAL);
            }
            Ok(())
        });

        let read = for_each_message(input, |message, size| {
            match message {
                IncomingMessage::Record { record } => {
                    summary.records_read += 1;
                    let payload = Bytes::from(encode_record(&record)?);
                    let len = payload.len() as u64;
                    enqueue.add_record(&record.descriptor(), payload, len)?;
                }
                IncomingMessage::State { state } => {
                    summary.states_read += 1;
                    enqueue.add_state(state, size)?;
                }
            }
            Ok(())
        });
        reading.store(false, Ordering::Release);

        let drained = drain
            .join()
            .map_err(|_| anyhow::anyhow!("flusher thread panicked"))?;
        read.and(drained)
    });

    read_result?;
    flusher.flush_all()?;
    if !manager.close()? {
        anyhow::bail!("Queues still held records after the final flush");
    }

    finish(summary, &stats, &emitted, start)
}

fn finish(
    mut summary: RunSummary,
    stats: &WriteStats,
    emitted: &Mutex<Vec<CheckpointMarker>>,
    start: Instant,
) -> Result<RunSummary> {
    summary.files_written = stats.files.load(Ordering::SeqCst);
    summary.records_written = stats.records.load(Ordering::SeqCst);
    summary.bytes_written = stats.bytes.load(Ordering::SeqCst);
    summary.checkpoints = emitted
        .lock()
        .map_err(|_| anyhow::anyhow!("checkpoint sink lock poisoned"))?
        .clone();
    summary.duration_secs = start.elapsed().as_secs_f64();
    tracing::info!(
        records = summary.records_written,
        files = summary.files_written,
        checkpoints = summary.checkpoints.len(),
        "Run finished"
    );
    Ok(summary)
}
