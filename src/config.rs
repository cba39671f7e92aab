//! Configuration
//!
//! Compile-time constants grouped by concern, plus the runtime
//! [`AppConfig`] loaded from `config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::RetryPolicy;
use crate::{log_debug, log_info};

const MODULE: &str = "config";

/// Application identity
pub mod app {
    pub const NAME: &str = "flashkit";
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const USER_AGENT: &str = concat!("flashkit/", env!("CARGO_PKG_VERSION"));
    pub const CONFIG_FILE: &str = "config.json";
}

/// Download and decompression tuning
pub mod download {
    /// Read buffer for streaming decompression and hashing
    pub const CHUNK_SIZE: usize = 1024 * 1024;
    /// Buffered reader/writer capacity around compressed streams
    pub const DECOMPRESS_BUFFER_SIZE: usize = 4 * 1024 * 1024;
    pub const MAX_RETRIES: u32 = 5;
    pub const BACKOFF_BASE_MS: u64 = 500;
    pub const BACKOFF_MAX_MS: u64 = 30_000;
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const READ_TIMEOUT_SECS: u64 = 60;
}

/// Block writer tuning
pub mod flash {
    pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;
    /// Chunks written between durable flushes
    pub const FLUSH_INTERVAL_CHUNKS: u64 = 16;
    pub const SECTOR_SIZE: usize = 512;
}

/// Progress logging intervals
pub mod logging {
    pub const DOWNLOAD_LOG_INTERVAL_MB: u64 = 50;
    pub const DECOMPRESS_LOG_INTERVAL_MB: u64 = 100;
    pub const VERIFY_LOG_INTERVAL_MB: u64 = 200;
    pub const FLASH_LOG_INTERVAL_MB: u64 = 100;
    pub const MAX_SESSION_LOGS: usize = 10;
}

/// Cache layout names
pub mod cache {
    pub const BLOB_FILE: &str = "blob";
    pub const PARTIAL_DIR: &str = "partial";
    pub const IMAGE_FILE: &str = "image";
    pub const ENTRY_FILE: &str = "entry.json";
    pub const SCRATCH_DIR: &str = "scratch";
}

/// Orchestrator tuning
pub mod jobs {
    /// Per-job progress event buffer; slow subscribers lose the oldest events
    pub const EVENT_CAPACITY: usize = 256;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which device enumeration backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformChoice {
    /// Pick from the build target
    #[default]
    Auto,
    Linux,
    Macos,
    Windows,
}

/// Network behaviour of the downloader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: download::MAX_RETRIES,
            backoff_base_ms: download::BACKOFF_BASE_MS,
            backoff_max_ms: download::BACKOFF_MAX_MS,
            connect_timeout_secs: download::CONNECT_TIMEOUT_SECS,
            read_timeout_secs: download::READ_TIMEOUT_SECS,
        }
    }
}

impl DownloadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries as usize + 1,
            Duration::from_millis(self.backoff_base_ms),
        )
        .with_max_delay(Duration::from_millis(self.backoff_max_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub chunk_size: usize,
    pub flush_interval_chunks: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: flash::CHUNK_SIZE,
            flush_interval_chunks: flash::FLUSH_INTERVAL_CHUNKS,
        }
    }
}

/// Runtime configuration, read from `<config_dir>/flashkit/config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Overrides the platform cache directory
    pub cache_dir: Option<PathBuf>,
    /// Local catalog file
    pub catalog_path: Option<PathBuf>,
    /// Remote catalog registry
    pub catalog_url: Option<String>,
    pub download: DownloadConfig,
    pub flash: FlashConfig,
    /// Per-job progress buffer, defaults to [`jobs::EVENT_CAPACITY`]
    pub event_capacity: Option<usize>,
    /// "debug" enables developer logging
    pub log_level: Option<String>,
    pub platform: PlatformChoice,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(app::NAME).join(app::CONFIG_FILE))
    }

    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => p,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            log_debug!(MODULE, "No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: AppConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;

        log_info!(MODULE, "Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flash.chunk_size == 0 || self.flash.chunk_size % flash::SECTOR_SIZE != 0 {
            return Err(ConfigError::Invalid(format!(
                "flash.chunk_size must be a non-zero multiple of {}",
                flash::SECTOR_SIZE
            )));
        }
        if self.flash.flush_interval_chunks == 0 {
            return Err(ConfigError::Invalid(
                "flash.flush_interval_chunks must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| crate::utils::get_cache_dir(app::NAME))
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(jobs::EVENT_CAPACITY)
    }

    pub fn debug_logging(&self) -> bool {
        self.log_level
            .as_deref()
            .map(|l| l.eq_ignore_ascii_case("debug"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.flash.chunk_size, flash::CHUNK_SIZE);
        assert_eq!(config.download.max_retries, download::MAX_RETRIES);
        assert_eq!(config.platform, PlatformChoice::Auto);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"download": {"max_retries": 2}, "log_level": "DEBUG", "platform": "linux"}"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.download.max_retries, 2);
        assert_eq!(config.download.backoff_base_ms, download::BACKOFF_BASE_MS);
        assert!(config.debug_logging());
        assert_eq!(config.platform, PlatformChoice::Linux);
    }

    #[test]
    fn test_rejects_unaligned_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"flash": {"chunk_size": 1000}}"#).unwrap();
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
