//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/kiosync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/kiosync/` (~/.config/kiosync/)
//! - Data: `$XDG_DATA_HOME/kiosync/` (~/.local/share/kiosync/)
//! - State/Logs: `$XDG_STATE_HOME/kiosync/` (~/.local/state/kiosync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Local store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Sync processor configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Definition cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote endpoints
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Connectivity probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local store configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StoreConfig {
    /// Override for the database file (defaults to the XDG data dir)
    pub path: Option<PathBuf>,

    /// SQLCipher key; requires the `sqlcipher` feature
    pub encryption_key: Option<String>,
}

/// Sync queue processing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Attempts after which a retryable failure is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Background trigger interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Pause between queue items in milliseconds
    #[serde(default = "default_item_pause_ms")]
    pub item_pause_ms: u64,

    /// Per-item remote call timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Base delay for exponential backoff between attempts of the same
    /// item. 0 disables backoff: items are retried on the next trigger.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Never sync over cellular connections
    #[serde(default)]
    pub wifi_only: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            interval_secs: default_interval_secs(),
            item_pause_ms: default_item_pause_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_backoff_ms: 0,
            wifi_only: false,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn item_pause(&self) -> Duration {
        Duration::from_millis(self.item_pause_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_interval_secs() -> u64 {
    300
}

fn default_item_pause_ms() -> u64 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Definition cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Age after which the cache is reported stale
    #[serde(default = "default_cache_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: default_cache_max_age_ms(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

fn default_cache_max_age_ms() -> u64 {
    300_000
}

/// Remote endpoint configuration
///
/// Any endpoint left unset is treated as not configured: queue items for it
/// are abandoned with a logged error.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Base URL of the remote document store
    pub document_store_url: Option<String>,

    /// Bearer token sent to every remote endpoint
    pub api_key: Option<String>,

    /// Base URL of the brand A API
    pub brand_a_url: Option<String>,

    /// Base URL of the brand B API
    pub brand_b_url: Option<String>,

    /// Poll interval for HTTP document store watches
    #[serde(default = "default_watch_poll_secs")]
    pub watch_poll_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            document_store_url: None,
            api_key: None,
            brand_a_url: None,
            brand_b_url: None,
            watch_poll_secs: default_watch_poll_secs(),
        }
    }
}

fn default_watch_poll_secs() -> u64 {
    5
}

/// Connectivity probe configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// `host:port` opened to decide internet reachability
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    /// Seconds between probes
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Probe connect timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_host: default_probe_host(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_probe_host() -> String {
    "1.1.1.1:443".to_string()
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Level for the queue processor and triggers; defaults to `level`
    #[serde(default)]
    pub sync_level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            sync_level: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(Error::Config(
                "sync.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(Error::Config(
                "sync.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.remote.watch_poll_secs == 0 {
            return Err(Error::Config(
                "remote.watch_poll_secs must be greater than 0".to_string(),
            ));
        }
        if self.connectivity.probe_interval_secs == 0 {
            return Err(Error::Config(
                "connectivity.probe_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.store.encryption_key.as_deref() == Some("") {
            return Err(Error::Config(
                "store.encryption_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/kiosync/config.toml` (~/.config/kiosync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("kiosync").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/kiosync/` (~/.local/share/kiosync/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("kiosync")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/kiosync/` (~/.local/state/kiosync/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("kiosync")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/kiosync/store.db` (~/.local/share/kiosync/store.db)
    pub fn default_database_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Database path honoring the `[store] path` override
    pub fn database_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(Self::default_database_path)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/kiosync/kiosync.log` (~/.local/state/kiosync/kiosync.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("kiosync.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.item_pause_ms, 100);
        assert_eq!(config.sync.retry_backoff_ms, 0);
        assert!(!config.sync.wifi_only);
        assert_eq!(config.cache.max_age(), Duration::from_millis(300_000));
        assert!(config.remote.document_store_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[store]
path = "/var/lib/kiosk/store.db"

[sync]
max_retries = 5
interval_secs = 60
wifi_only = true

[remote]
document_store_url = "https://docs.example.com"
brand_a_url = "https://brand-a.example.com/api"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/kiosk/store.db")
        );
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.interval(), Duration::from_secs(60));
        assert_eq!(config.sync.item_pause_ms, 100);
        assert!(config.sync.wifi_only);
        assert_eq!(
            config.remote.brand_a_url.as_deref(),
            Some("https://brand-a.example.com/api")
        );
        assert!(config.remote.brand_b_url.is_none());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.connectivity.probe_host, "1.1.1.1:443");
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = Config::default();
        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_key() {
        let mut config = Config::default();
        config.store.encryption_key = Some(String::new());
        assert!(config.validate().is_err());
    }
}
