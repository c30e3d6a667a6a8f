// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::Settings;

const APP_DIR: &str = "podkeep";
const STATE_FILENAME: &str = "library.json";

/// Top-level configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for downloaded episodes and the library state file
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,

    /// Number of download workers
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,

    /// Maximum number of subscriptions refreshed at the same time
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,

    /// Capacity of the download queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Interval of the periodic refresh in `watch` mode
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_minutes: u64,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Initial download policy settings
    #[serde(default)]
    pub settings: Settings,
}

/// HTTP client limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request timeout for feed fetches
    pub feed_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Maximum wait for the next chunk of a streamed download
    pub chunk_timeout_secs: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            feed_timeout_secs: 30,
            connect_timeout_secs: 10,
            chunk_timeout_secs: 60,
            max_redirects: 10,
            user_agent: concat!("podkeep/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Exponential backoff parameters for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Randomize each delay between 1x and 2x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_library_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_download_workers() -> usize {
    3
}

fn default_refresh_concurrency() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    256
}

fn default_refresh_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            download_workers: default_download_workers(),
            refresh_concurrency: default_refresh_concurrency(),
            queue_capacity: default_queue_capacity(),
            refresh_interval_minutes: default_refresh_interval(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            settings: Settings::default(),
        }
    }
}

impl Config {
    /// Load the configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Default configuration file location (`<config dir>/podkeep/config.toml`)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Location of the persisted library state
    pub fn state_file(&self) -> PathBuf {
        self.library_dir.join(STATE_FILENAME)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) * 60)
    }
}
