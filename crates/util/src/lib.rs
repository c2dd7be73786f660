//! Helpers shared by the batchflow engine and command line: configuration
//! loading, path and file-pattern handling, and message formatting.

pub mod config;
pub mod file_pattern;
pub mod path_processing;
pub mod text_template;

pub use config::{CONFIG_PATH_ENV, ConfigError, EngineConfig, default_config_path};
pub use file_pattern::{is_wildcard, matching_files};
pub use path_processing::{expand_tilde, field_reference, resolve_reference, substitute_parent};
pub use text_template::format_positional;
