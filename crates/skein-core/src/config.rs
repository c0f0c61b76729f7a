//! Configuration for the skein cache and daemon.
//!
//! Loaded from `.skein/config.toml` in the repository root; every key has a
//! default so a missing file is not an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Repository-level skein configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkeinConfig {
    /// Directory containing task files, relative to the repo root.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: String,

    /// Directory containing dependency files, relative to the repo root.
    #[serde(default = "default_deps_dir")]
    pub deps_dir: String,

    /// Directory holding the cache database and other derived state.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Minimum quiescence (milliseconds) before a changed path is dispatched.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound (seconds) on blocked-closure staleness.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Op-log polling cadence in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Connection pool tuning.
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Bounds on the cache's database connection pool.
///
/// The defaults suit interactive workloads; high-concurrency runs raise
/// `max_open` to ~150.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_open")]
    pub max_open: usize,

    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_tasks_dir() -> String {
    "tasks".to_string()
}

fn default_deps_dir() -> String {
    "deps".to_string()
}

fn default_cache_dir() -> String {
    ".skein".to_string()
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_refresh_secs() -> u64 {
    5
}

fn default_poll_ms() -> u64 {
    100
}

fn default_max_open() -> usize {
    25
}

fn default_max_idle() -> usize {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl SkeinConfig {
    /// Load configuration from `<root>/.skein/config.toml`, or defaults if
    /// the file does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".skein/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default configuration to `<root>/.skein/config.toml`.
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".skein");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    /// Path of the cache database under the configured cache directory.
    pub fn db_path(&self, root: &Path) -> PathBuf {
        root.join(&self.cache_dir).join("cache.db")
    }

    pub fn tasks_path(&self, root: &Path) -> PathBuf {
        root.join(&self.tasks_dir)
    }

    pub fn deps_path(&self, root: &Path) -> PathBuf {
        root.join(&self.deps_dir)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Default for SkeinConfig {
    fn default() -> Self {
        Self {
            tasks_dir: default_tasks_dir(),
            deps_dir: default_deps_dir(),
            cache_dir: default_cache_dir(),
            debounce_ms: default_debounce_ms(),
            refresh_secs: default_refresh_secs(),
            poll_ms: default_poll_ms(),
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}
