//! Engine YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::EngineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        std::env::var(name).unwrap_or_else(|_| {
            missing.push(name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(substituted.into_owned())
}

/// Parse an engine YAML string. An empty document yields the defaults.
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<EngineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    if substituted.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(&substituted).context("Failed to parse engine config YAML")
}

/// Parse an engine YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_env_vars() {
        std::env::set_var("BSP_TEST_BUDGET", "64mb");
        let out = substitute_env_vars("max_bytes: ${BSP_TEST_BUDGET}").unwrap();
        assert_eq!(out, "max_bytes: 64mb");
        std::env::remove_var("BSP_TEST_BUDGET");
    }

    #[test]
    fn passthrough_without_vars() {
        let input = "memory:\n  max_bytes: 1gb";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn all_missing_vars_are_reported() {
        let err = substitute_env_vars("${BSP_MISSING_X} ${BSP_MISSING_Y}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("BSP_MISSING_X"));
        assert!(err.contains("BSP_MISSING_Y"));
    }

    #[test]
    fn empty_document_gives_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config.memory.max_bytes, "256mb");
        assert_eq!(config.flush.max_concurrent_streams, 10);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        std::env::set_var("BSP_TEST_STREAM_LIMIT", "8mb");
        let yaml = r"
memory:
  max_bytes: 128mb
flush:
  max_per_stream_bytes: ${BSP_TEST_STREAM_LIMIT}
  max_concurrent_streams: 3
backpressure:
  sleep_ms: 20
";
        let config = parse_config_str(yaml).unwrap();
        std::env::remove_var("BSP_TEST_STREAM_LIMIT");
        assert_eq!(config.memory.max_bytes, "128mb");
        assert_eq!(config.memory.chunk_bytes, "10mb");
        assert_eq!(config.flush.max_per_stream_bytes, "8mb");
        assert_eq!(config.flush.max_total_bytes, "256mb");
        assert_eq!(config.flush.max_concurrent_streams, 3);
        assert_eq!(config.backpressure.retries_before_sleep, 5);
        assert_eq!(config.backpressure.sleep_ms, 20);
        assert_eq!(config.drain.max_batch_bytes, "16mb");
    }

    #[test]
    fn bare_integer_sizes_are_bytes() {
        let config = parse_config_str("memory:\n  max_bytes: 1048576").unwrap();
        assert_eq!(config.memory.max_bytes, "1048576");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_config_str("memory:\n  max_byte: 1mb").is_err());
    }

    #[test]
    fn parses_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "drain:\n  max_batch_bytes: 1mb\n").unwrap();
        let config = parse_config(&path).unwrap();
        assert_eq!(config.drain.max_batch_bytes, "1mb");
    }

    #[test]
    fn missing_file_errors_with_path() {
        let err = parse_config(Path::new("/nonexistent/engine.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("/nonexistent/engine.yaml"));
    }
}
