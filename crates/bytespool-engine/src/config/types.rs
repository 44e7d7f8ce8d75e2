//! Configuration types with defaults.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::enqueue::BackpressurePolicy;
use crate::memory::MemoryManager;
use crate::registry::FlushLimits;

/// Parse a human byte size such as `512kb`, `10mb`, `1gb`, or `4096`.
/// Units are binary (1kb = 1024 bytes) and case-insensitive.
///
/// # Errors
///
/// Returns an error if the number or unit is not recognised.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        bail!("Invalid byte size '{input}': missing number");
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("Invalid byte size '{input}'"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        other => bail!("Invalid byte size '{input}': unknown unit '{other}'"),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Byte size '{input}' overflows"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Text(String),
    Bytes(u64),
}

/// Accept both `10mb` and a bare integer for byte-size fields.
fn size_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match RawSize::deserialize(deserializer)? {
        RawSize::Text(text) => text,
        RawSize::Bytes(n) => n.to_string(),
    })
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub drain: DrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default = "default_max_memory", deserialize_with = "size_string")]
    pub max_bytes: String,
    #[serde(default = "default_chunk", deserialize_with = "size_string")]
    pub chunk_bytes: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_memory(),
            chunk_bytes: default_chunk(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlushConfig {
    #[serde(default = "default_max_per_stream", deserialize_with = "size_string")]
    pub max_per_stream_bytes: String,
    #[serde(default = "default_max_total", deserialize_with = "size_string")]
    pub max_total_bytes: String,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_per_stream_bytes: default_max_per_stream(),
            max_total_bytes: default_max_total(),
            max_concurrent_streams: default_max_concurrent_streams(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackpressureConfig {
    #[serde(default = "default_retries_before_sleep")]
    pub retries_before_sleep: u32,
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            retries_before_sleep: default_retries_before_sleep(),
            sleep_ms: default_sleep_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrainConfig {
    #[serde(default = "default_max_batch", deserialize_with = "size_string")]
    pub max_batch_bytes: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: default_max_batch(),
        }
    }
}

fn default_max_memory() -> String {
    "256mb".to_string()
}

fn default_chunk() -> String {
    "10mb".to_string()
}

fn default_max_per_stream() -> String {
    "64mb".to_string()
}

fn default_max_total() -> String {
    "256mb".to_string()
}

fn default_max_concurrent_streams() -> usize {
    FlushLimits::DEFAULT_MAX_CONCURRENT_STREAMS
}

fn default_retries_before_sleep() -> u32 {
    BackpressurePolicy::DEFAULT_RETRIES_BEFORE_SLEEP
}

fn default_sleep_ms() -> u64 {
    500
}

fn default_max_batch() -> String {
    "16mb".to_string()
}

impl EngineConfig {
    /// # Errors
    ///
    /// Returns an error if a size is malformed or the allocator rejects it.
    pub fn memory_manager(&self) -> Result<MemoryManager> {
        let max = parse_byte_size(&self.memory.max_bytes).context("memory.max_bytes")?;
        let chunk = parse_byte_size(&self.memory.chunk_bytes).context("memory.chunk_bytes")?;
        Ok(MemoryManager::new(max, chunk)?)
    }

    /// # Errors
    ///
    /// Returns an error if a size is malformed.
    pub fn flush_limits(&self) -> Result<FlushLimits> {
        Ok(FlushLimits {
            max_total_bytes: parse_byte_size(&self.flush.max_total_bytes)
                .context("flush.max_total_bytes")?,
            max_per_stream_bytes: parse_byte_size(&self.flush.max_per_stream_bytes)
                .context("flush.max_per_stream_bytes")?,
            max_concurrent_streams: self.flush.max_concurrent_streams,
        })
    }

    #[must_use]
    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        BackpressurePolicy {
            retries_before_sleep: self.backpressure.retries_before_sleep,
            sleep: Duration::from_millis(self.backpressure.sleep_ms),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the size is malformed.
    pub fn drain_max_batch_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.drain.max_batch_bytes).context("drain.max_batch_bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAllocator, DEFAULT_CHUNK_BYTES};
    use rstest::rstest;

    #[rstest]
    #[case("4096", 4096)]
    #[case("12b", 12)]
    #[case("512kb", 512 * 1024)]
    #[case("10mb", 10 * 1024 * 1024)]
    #[case("10MB", 10 * 1024 * 1024)]
    #[case(" 2 gb ", 2 * 1024 * 1024 * 1024)]
    #[case("1g", 1024 * 1024 * 1024)]
    fn parses_byte_sizes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_byte_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("mb")]
    #[case("10tb")]
    #[case("-5mb")]
    #[case("99999999999999999999gb")]
    fn rejects_bad_byte_sizes(#[case] input: &str) {
        assert!(parse_byte_size(input).is_err());
    }

    #[test]
    fn defaults_match_engine_constants() {
        let config = EngineConfig::default();
        let limits = config.flush_limits().unwrap();
        assert_eq!(limits, FlushLimits::default());
        assert_eq!(config.backpressure_policy(), BackpressurePolicy::default());
        assert_eq!(config.drain_max_batch_bytes().unwrap(), 16 * 1024 * 1024);

        let memory = config.memory_manager().unwrap();
        assert_eq!(memory.max_memory_bytes(), 256 * 1024 * 1024);
        assert_eq!(memory.chunk_bytes(), DEFAULT_CHUNK_BYTES);
    }
}
