use std::path::Path;

use anyhow::{Context, Result};
use bytespool_engine::config::{parser, validator};
use bytespool_engine::MemoryAllocator;

/// Execute the `check` command: parse and validate an engine config.
pub fn execute(config_path: &Path) -> Result<()> {
    let config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to parse config: {}", config_path.display()))?;
    validator::validate_config(&config)?;

    let memory = config.memory_manager()?;
    let limits = config.flush_limits()?;
    let policy = config.backpressure_policy();

    println!("Config structure: OK");
    println!("  Memory budget:      {}", format_bytes(memory.max_memory_bytes()));
    println!("  Allocation chunk:   {}", format_bytes(memory.chunk_bytes()));
    println!("  Per-stream flush:   {}", format_bytes(limits.max_per_stream_bytes));
    println!("  Total flush:        {}", format_bytes(limits.max_total_bytes));
    println!("  Max live streams:   {}", limits.max_concurrent_streams);
    println!(
        "  Backpressure:       {} retries, then {}ms sleeps",
        policy.retries_before_sleep,
        policy.sleep.as_millis()
    );
    println!(
        "  Drain batch:        {}",
        format_bytes(config.drain_max_batch_bytes()?)
    );
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
