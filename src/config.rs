//! Moderator configuration
//!
//! Read from a YAML file when present, then overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::moderation::DEFAULT_REASON;

/// Environment variable overriding the storage path
pub const STORAGE_ENV: &str = "CASE_WARDEN_STORAGE";
/// Environment variable overriding the sweep interval, in milliseconds
pub const SWEEP_INTERVAL_ENV: &str = "CASE_WARDEN_SWEEP_INTERVAL_MS";
/// Environment variable overriding the backend call timeout, in milliseconds
pub const BACKEND_TIMEOUT_ENV: &str = "CASE_WARDEN_BACKEND_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for the case registry and the expiration sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeratorConfig {
    /// Case document location
    pub storage_path: PathBuf,
    /// Time between two expiration sweeps
    pub sweep_interval_ms: u64,
    /// Upper bound for a single call to the platform
    pub backend_timeout_ms: u64,
    /// Reason recorded when a ban or mute is issued without one
    pub default_reason: String,
}

impl Default for ModeratorConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./cases.json"),
            sweep_interval_ms: 5_000,
            backend_timeout_ms: 10_000,
            default_reason: DEFAULT_REASON.to_string(),
        }
    }
}

impl ModeratorConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Parse a YAML document. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed or a value is out of range.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file if it exists, then apply environment overrides
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or an override is invalid.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_yaml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup(STORAGE_ENV) {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(SWEEP_INTERVAL_ENV) {
            self.sweep_interval_ms = parse_millis(SWEEP_INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(BACKEND_TIMEOUT_ENV) {
            self.backend_timeout_ms = parse_millis(BACKEND_TIMEOUT_ENV, &value)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.backend_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_reason.trim().is_empty() {
            return Err(ConfigError::Invalid("default_reason must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value}: {e}")))
}
