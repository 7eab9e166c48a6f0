//! TOML configuration for every Convoy process.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-host setup backed by `./data`.

use crate::error::{ConvoyError, ConvoyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration, usually read from `convoy.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvoyConfig {
    /// Backing store selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Lock manager tuning.
    #[serde(default)]
    pub locks: LockConfig,
    /// Controller loop tuning.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Agent runtime tuning.
    #[serde(default)]
    pub agent: AgentConfig,
    /// External commands the `convoy agent` role runs per task type.
    #[serde(default)]
    pub handlers: Vec<HandlerCommandConfig>,
}

/// Which [`StorageBackend`] to use and where it keeps its data.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Available storage backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; state is lost on exit.
    Memory,
    /// One JSON file per record, shared between processes.
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Locks older than this may be reclaimed. `0` disables reclaiming.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Per-task handler timeout. `0` means no timeout.
    #[serde(default)]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            task_timeout_secs: 0,
            default_max_attempts: default_max_attempts(),
        }
    }
}

/// Maps a task type to an external program.
///
/// The program receives the task payload as JSON on stdin and must print a
/// JSON result on stdout. A non-zero exit status fails the task.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerCommandConfig {
    pub task_type: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_retry_interval_ms() -> u64 {
    50
}
fn default_stale_after_secs() -> u64 {
    60
}
fn default_interval_secs() -> u64 {
    2
}
fn default_heartbeat_timeout_secs() -> u64 {
    60
}
fn default_retention_days() -> u64 {
    7
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_poll_interval_secs() -> u64 {
    3
}
fn default_max_attempts() -> u32 {
    3
}

impl ConvoyConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> ConvoyResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ConvoyError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ConvoyResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConvoyError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    fn validate(&self) -> ConvoyResult<()> {
        if self.controller.interval_secs == 0 {
            return Err(ConvoyError::Config(
                "controller.interval_secs must be greater than 0".into(),
            ));
        }
        if self.agent.default_max_attempts == 0 {
            return Err(ConvoyError::Config(
                "agent.default_max_attempts must be at least 1".into(),
            ));
        }
        if self.locks.retry_interval_ms == 0 {
            return Err(ConvoyError::Config(
                "locks.retry_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
