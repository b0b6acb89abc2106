//! Configuration handling
//!
//! Manages the classnotes-sync.toml configuration file. Every field has a
//! default, so a missing file yields the default configuration.
//!
//! ## Environment Variables
//!
//! The following environment variables override config file settings:
//!
//! - `CLASSNOTES_DATA_DIR` - Directory of the local database
//! - `CLASSNOTES_REMOTE_URL` - Base URL of the remote data service
//! - `CLASSNOTES_AUTH_TOKEN` - Bearer token sent to the remote
//! - `CLASSNOTES_MAX_RETRIES` - Failed drain attempts before an operation is dropped
//! - `CLASSNOTES_BACKOFF_BASE_MS` - First retry delay
//! - `CLASSNOTES_SYNC_INTERVAL_SECS` - Periodic sync interval (0 disables)
//!
//! These can be set in a `.env` file next to the configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::sync::coordinator::CoordinatorConfig;
use crate::sync::retry::RetryPolicy;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "classnotes-sync.toml";

/// Environment variable names
pub const ENV_DATA_DIR: &str = "CLASSNOTES_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "CLASSNOTES_REMOTE_URL";
pub const ENV_AUTH_TOKEN: &str = "CLASSNOTES_AUTH_TOKEN";
pub const ENV_MAX_RETRIES: &str = "CLASSNOTES_MAX_RETRIES";
pub const ENV_BACKOFF_BASE_MS: &str = "CLASSNOTES_BACKOFF_BASE_MS";
pub const ENV_SYNC_INTERVAL_SECS: &str = "CLASSNOTES_SYNC_INTERVAL_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory of the local RocksDB database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Failed drain attempts before a pending operation is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Low-level attempts per remote call
    #[serde(default = "default_call_attempts")]
    pub call_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Page size for remote list calls
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Periodic sync interval in seconds, 0 disables the timer
    #[serde(default)]
    pub sync_interval_secs: u64,
    /// Age after which synced records may be purged from the cache
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Base URL of the remote data service
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// `host:port` probed to detect connectivity
    #[serde(default)]
    pub probe_addr: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_retries() -> u32 {
    3
}

fn default_call_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_page_size() -> usize {
    100
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_probe_interval_secs() -> u64 {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_retries: default_max_retries(),
            call_attempts: default_call_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            page_size: default_page_size(),
            sync_interval_secs: 0,
            cache_ttl_secs: default_cache_ttl_secs(),
            remote_url: None,
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            probe_addr: None,
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a directory
    ///
    /// This also loads any `.env` file in the directory and applies
    /// environment variable overrides.
    pub fn load(dir: &Path) -> SyncResult<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            Self::from_toml(&std::fs::read_to_string(&config_path)?)?
        } else {
            tracing::debug!("{} not found, using defaults", config_path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> SyncResult<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`; empty or unparsable values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(dir) = get(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = get(ENV_REMOTE_URL) {
            self.remote_url = Some(url);
        }
        if let Some(token) = get(ENV_AUTH_TOKEN) {
            self.auth_token = Some(token);
        }
        if let Some(n) = get(ENV_MAX_RETRIES).and_then(|v| v.parse().ok()) {
            self.max_retries = n;
        }
        if let Some(ms) = get(ENV_BACKOFF_BASE_MS).and_then(|v| v.parse().ok()) {
            self.backoff_base_ms = ms;
        }
        if let Some(secs) = get(ENV_SYNC_INTERVAL_SECS).and_then(|v| v.parse().ok()) {
            self.sync_interval_secs = secs;
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".into()));
        }
        if self.backoff_base_ms > self.max_backoff_ms {
            return Err(SyncError::Config(
                "backoff_base_ms cannot exceed max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            call_attempts: self.call_attempts.max(1),
            max_retries: self.max_retries,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            policy: self.retry_policy(),
            page_size: self.page_size,
            sync_interval: (self.sync_interval_secs > 0)
                .then(|| Duration::from_secs(self.sync_interval_secs)),
            ..CoordinatorConfig::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}
