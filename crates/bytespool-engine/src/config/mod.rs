//! Engine configuration: YAML parsing, defaults, and validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_config, parse_config_str, substitute_env_vars};
pub use types::{parse_byte_size, EngineConfig};
pub use validator::validate_config;
