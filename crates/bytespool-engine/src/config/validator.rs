//! Semantic validation for parsed engine configuration values.

use anyhow::{bail, Result};

use crate::config::types::{parse_byte_size, EngineConfig};

/// Parse `value`, recording an error if it is malformed or zero.
fn positive_size(value: &str, key: &str, errors: &mut Vec<String>) -> Option<u64> {
    match parse_byte_size(value) {
        Ok(0) => {
            errors.push(format!("{key} must be > 0"));
            None
        }
        Ok(n) => Some(n),
        Err(_) => {
            errors.push(format!("{key}: invalid byte size '{value}'"));
            None
        }
    }
}

/// Validate a parsed engine configuration.
///
/// # Errors
///
/// Returns an error listing every validation failure found.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    let mut errors = Vec::new();

    let budget = positive_size(&config.memory.max_bytes, "memory.max_bytes", &mut errors);
    let chunk = positive_size(&config.memory.chunk_bytes, "memory.chunk_bytes", &mut errors);
    let per_stream = positive_size(
        &config.flush.max_per_stream_bytes,
        "flush.max_per_stream_bytes",
        &mut errors,
    );
    let total = positive_size(
        &config.flush.max_total_bytes,
        "flush.max_total_bytes",
        &mut errors,
    );
    positive_size(
        &config.drain.max_batch_bytes,
        "drain.max_batch_bytes",
        &mut errors,
    );

    if let (Some(budget), Some(chunk)) = (budget, chunk) {
        if chunk > budget {
            errors.push(format!(
                "memory.chunk_bytes ({chunk}) must not exceed memory.max_bytes ({budget})"
            ));
        }
    }

    if let (Some(per_stream), Some(total)) = (per_stream, total) {
        if per_stream > total {
            errors.push(format!(
                "flush.max_per_stream_bytes ({per_stream}) must not exceed flush.max_total_bytes ({total})"
            ));
        }
    }

    if config.flush.max_concurrent_streams == 0 {
        errors.push("flush.max_concurrent_streams must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Config validation failed:\n  - {}", errors.join("\n  - "));
    }
}
