//! TOML-backed configuration.
//!
//! Every setting has a built-in default, so a missing or partial file is
//! never fatal: [`Config::load`] overlays whatever the user wrote on top of
//! the defaults and only warns when a file exists but cannot be used. The
//! file lives at the platform config location reported by [`Config::path`],
//! e.g. `~/.config/shroud/shroud.toml` on Linux.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pool::{PoolConfig, Sizing};
use crate::{DEFAULT_FACTOR, DEFAULT_MAX_CAPACITY};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Buffer pool settings
    pub pool: PoolSettings,
    /// Per-session TLS policy
    pub session: SessionSettings,
    /// Callback executor settings
    pub executor: ExecutorSettings,
}

/// Buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Smallest pooled buffer size in bytes
    pub min_capacity: usize,
    /// Largest pooled buffer size in bytes
    pub max_capacity: usize,
    /// Linear capacity-class factor in bytes; 0 selects power-of-two classes
    pub factor: usize,
    /// Maximum idle entries per capacity class
    pub max_bucket_entries: usize,
    /// Idle-byte cap for heap buffers (0 = unlimited)
    pub max_heap_bytes: usize,
    /// Idle-byte cap for transport-mapped buffers (0 = unlimited)
    pub max_mapped_bytes: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: DEFAULT_MAX_CAPACITY,
            factor: DEFAULT_FACTOR,
            max_bucket_entries: 128,
            max_heap_bytes: 32 * 1024 * 1024, // 32MB
            max_mapped_bytes: 0,
        }
    }
}

impl PoolSettings {
    /// Builds the pool construction parameters these settings describe.
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            sizing: if self.factor == 0 {
                Sizing::PowerOfTwo
            } else {
                Sizing::Linear {
                    factor: self.factor,
                }
            },
            max_bucket_entries: self.max_bucket_entries,
            max_heap_bytes: self.max_heap_bytes,
            max_mapped_bytes: self.max_mapped_bytes,
        }
    }
}

/// TLS session policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Allow mid-stream renegotiation (pre-TLS 1.3 peers)
    pub renegotiation_allowed: bool,
    /// Renegotiations permitted per session (-1 = unlimited, 0 = none)
    pub renegotiation_limit: i64,
    /// Treat inbound end-of-stream without close-notify as an error
    pub require_close_notify: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renegotiation_allowed: true,
            renegotiation_limit: -1,
            require_close_notify: false,
        }
    }
}

/// Callback executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Worker threads dispatching session callbacks
    pub worker_threads: usize,
    /// Bounded job queue depth (backpressure on dispatch)
    pub queue_depth: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_depth: 1024,
        }
    }
}

impl Config {
    /// Best-effort load: the user's file overlaid on the defaults.
    ///
    /// Absence of a config directory or file is normal and silent (debug
    /// only); a file that exists but cannot be read or parsed is reported
    /// once and ignored.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            debug!("no platform config directory; using built-in defaults");
            return Self::default();
        };
        if !path.exists() {
            debug!(path = ?path, "no config file; using built-in defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(error) => {
                warn!(path = ?path, %error, "ignoring unusable config file");
                Self::default()
            }
        }
    }

    /// Parses the file at `path`. Unlike [`Config::load`], the file must
    /// exist and parse; absent keys still fall back to defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let config = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        debug!(path = ?path, "configuration loaded");
        Ok(config)
    }

    /// Renders the configuration as pretty TOML at `path`, creating missing
    /// parent directories.
    pub fn store(&self, path: &Path) -> Result<(), ConfigError> {
        let rendered =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
                path: dir.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
        std::fs::write(path, rendered).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        info!(path = ?path, "configuration written");
        Ok(())
    }

    /// Platform location of the config file, when the platform reports one.
    pub fn path() -> Option<PathBuf> {
        ProjectDirs::from("io", "shroud", "shroud")
            .map(|dirs| dirs.config_dir().join("shroud.toml"))
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {detail}")]
    Read { path: PathBuf, detail: String },

    #[error("cannot parse {path:?}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("cannot render configuration: {0}")]
    Render(String),

    #[error("cannot write {path:?}: {detail}")]
    Write { path: PathBuf, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_describe_the_standard_pool() {
        let config = Config::default();
        let pool = config.pool.to_pool_config();
        assert_eq!(pool.sizing, Sizing::Linear { factor: DEFAULT_FACTOR });
        assert_eq!(pool.max_capacity, DEFAULT_MAX_CAPACITY);
        assert_eq!(pool.min_capacity, 1);

        assert!(config.session.renegotiation_allowed);
        assert_eq!(config.session.renegotiation_limit, -1);
        assert!(!config.session.require_close_notify);
        assert_eq!(config.executor.worker_threads, 4);
    }

    #[test]
    fn test_zero_factor_selects_power_of_two() {
        let settings = PoolSettings {
            factor: 0,
            ..PoolSettings::default()
        };
        assert_eq!(settings.to_pool_config().sizing, Sizing::PowerOfTwo);
    }

    #[test]
    fn test_partial_file_keeps_other_sections_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shroud.toml");
        std::fs::write(&path, "[executor]\nworker_threads = 2\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.executor.worker_threads, 2);
        // Untouched sections come from the defaults.
        assert_eq!(config.executor.queue_depth, 1024);
        assert_eq!(config.pool.factor, DEFAULT_FACTOR);
        assert_eq!(config.session.renegotiation_limit, -1);
    }

    #[test]
    fn test_store_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shroud.toml");

        let mut config = Config::default();
        config.pool.max_heap_bytes = 1234;
        config.session.require_close_notify = true;
        config.store(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.pool.max_heap_bytes, 1234);
        assert!(reloaded.session.require_close_notify);
        assert_eq!(reloaded.pool.factor, config.pool.factor);
    }

    #[test]
    fn test_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("shroud.toml");
        Config::default().store(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let err = Config::load_from(Path::new("/no/such/dir/shroud.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_garbage_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shroud.toml");
        std::fs::write(&path, "pool = ]not toml[").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
