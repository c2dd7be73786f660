//! Engine configuration loaded from a YAML file.
//!
//! The file location is taken from the `--config` argument when given, then
//! from `BATCHFLOW_CONFIG_PATH`, then from the standard configuration
//! directory (`~/.config/batchflow/config.yaml` on most platforms). A missing
//! default file yields the built-in defaults; an explicitly named file must
//! exist.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::expand_tilde;

/// Environment variable allowing callers to override the configuration path.
pub const CONFIG_PATH_ENV: &str = "BATCHFLOW_CONFIG_PATH";

/// Default filename inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Settings shared by the runtime and the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding service definition files (`*.yaml`, `*.yml`, `*.json`).
    pub services_dir: PathBuf,
    /// Optional message catalog file.
    pub messages_file: Option<PathBuf>,
    /// Schema used when a service does not name one.
    pub default_schema: Option<String>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Default for batch steps that do not declare `interruptible`.
    pub interruptible: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from("services"),
            messages_file: None,
            default_schema: None,
            log_filter: "info".to_string(),
            interruptible: true,
        }
    }
}

impl EngineConfig {
    /// Load the configuration, preferring `explicit` over the environment and
    /// the default location.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_path(&expand_tilde(&path.to_string_lossy())),
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_path(&path)
                } else {
                    debug!(path = %path.display(), "no configuration file; using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse the file at `path`. Relative directories inside it are resolved
    /// against the file's own directory.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.services_dir = anchor(base, &config.services_dir);
        config.messages_file = config.messages_file.map(|file| anchor(base, &file));
        debug!(path = %path.display(), services_dir = %config.services_dir.display(), "loaded configuration");
        Ok(config)
    }
}

/// Location used when no explicit configuration path is supplied.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("batchflow")
        .join(CONFIG_FILE_NAME)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() { expanded } else { base.join(expanded) }
}
