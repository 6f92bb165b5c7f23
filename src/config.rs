//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Worker process launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker executable (e.g., `python3` or a bundled backend binary).
    pub executable: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory the worker is started in; inherits ours when absent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Seconds to wait for a cooperative exit before force-killing.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
    /// Longest protocol line accepted from the worker.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl WorkerConfig {
    /// Grace period granted to the worker before a forced kill.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

fn default_max_line_bytes() -> usize {
    1_048_576
}

/// Generation session tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Consecutive unparseable lines tolerated before the session fails.
    #[serde(default = "default_decode_failure_threshold")]
    pub decode_failure_threshold: u32,
    /// Progress polling cadence in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl SessionConfig {
    /// Progress polling cadence.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            decode_failure_threshold: default_decode_failure_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_decode_failure_threshold() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Location of the persisted user settings file.
    pub settings_path: PathBuf,
    /// Worker process launch settings.
    pub worker: WorkerConfig,
    /// Session tolerance and polling cadence.
    #[serde(default)]
    pub session: SessionConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.executable.trim().is_empty() {
            return Err(AppError::Config(
                "worker.executable must not be empty".into(),
            ));
        }

        if self.worker.max_line_bytes == 0 {
            return Err(AppError::Config(
                "worker.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.session.decode_failure_threshold == 0 {
            return Err(AppError::Config(
                "session.decode_failure_threshold must be greater than zero".into(),
            ));
        }

        if self.session.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "session.poll_interval_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
