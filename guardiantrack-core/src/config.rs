//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/guardiantrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/guardiantrack/` (~/.config/guardiantrack/)
//! - Data: `$XDG_DATA_HOME/guardiantrack/` (~/.local/share/guardiantrack/)
//! - State/Logs: `$XDG_STATE_HOME/guardiantrack/` (~/.local/state/guardiantrack/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "guardiantrack";

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
    /// Remote collection endpoint
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Reachability probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Capture source behaviour
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Diagnostic read path
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote collection endpoint configuration
///
/// Each timeout phase is configured independently.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Full URL that capture events are POSTed to
    pub url: Option<String>,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Seconds allowed to establish a connection
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds allowed between reads of the response
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Seconds allowed to send the request body
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
        }
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Check the endpoint is usable for uploads
    pub fn validate(&self) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("endpoint.url is required".to_string()))?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "endpoint.url must be an http(s) URL, got '{}'",
                url
            )));
        }

        if self.connect_timeout_secs == 0
            || self.read_timeout_secs == 0
            || self.write_timeout_secs == 0
        {
            return Err(Error::Config(
                "endpoint timeouts must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Reachability probe configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// Seconds between reachability probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// URL to probe; defaults to the endpoint URL
    pub probe_url: Option<String>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_url: None,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn default_probe_interval() -> u64 {
    15
}

/// Capture source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Newest call/SMS entries submitted per service start
    #[serde(default = "default_log_batch_limit")]
    pub log_batch_limit: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_batch_limit: default_log_batch_limit(),
        }
    }
}

fn default_log_batch_limit() -> usize {
    10
}

/// Diagnostic read path configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiagnosticsConfig {
    /// Default number of recent queued uploads to show
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            recent_limit: default_recent_limit(),
        }
    }
}

fn default_recent_limit() -> usize {
    10
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
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate settings that do not depend on whether uploading is enabled
    pub fn validate(&self) -> Result<()> {
        if self.capture.log_batch_limit == 0 {
            return Err(Error::Config(
                "capture.log_batch_limit must be greater than zero".to_string(),
            ));
        }
        if self.diagnostics.recent_limit == 0 {
            return Err(Error::Config(
                "diagnostics.recent_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// URL used for reachability probes
    pub fn probe_url(&self) -> Option<&str> {
        self.connectivity
            .probe_url
            .as_deref()
            .or(self.endpoint.url.as_deref())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/guardiantrack/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the queue database path
    ///
    /// `$XDG_DATA_HOME/guardiantrack/queue.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// Called by the binary before anything reads these env vars.
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
        assert!(config.endpoint.url.is_none());
        assert_eq!(config.endpoint.connect_timeout_secs, 30);
        assert_eq!(config.endpoint.read_timeout_secs, 30);
        assert_eq!(config.endpoint.write_timeout_secs, 30);
        assert_eq!(config.capture.log_batch_limit, 10);
        assert_eq!(config.diagnostics.recent_limit, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[endpoint]
url = "https://collector.example.com/exec"
connect_timeout_secs = 5
read_timeout_secs = 20

[connectivity]
probe_interval_secs = 3

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.endpoint.url.as_deref(),
            Some("https://collector.example.com/exec")
        );
        assert_eq!(config.endpoint.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.endpoint.read_timeout(), Duration::from_secs(20));
        assert_eq!(config.endpoint.write_timeout(), Duration::from_secs(30));
        assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "debug");
        assert!(config.endpoint.validate().is_ok());
    }

    #[test]
    fn test_probe_url_falls_back_to_endpoint() {
        let mut config = Config::default();
        assert!(config.probe_url().is_none());

        config.endpoint.url = Some("https://collector.example.com/exec".to_string());
        assert_eq!(
            config.probe_url(),
            Some("https://collector.example.com/exec")
        );

        config.connectivity.probe_url = Some("https://collector.example.com/ping".to_string());
        assert_eq!(
            config.probe_url(),
            Some("https://collector.example.com/ping")
        );
    }

    #[test]
    fn test_endpoint_validation() {
        let endpoint = EndpointConfig::default();
        assert!(endpoint.validate().is_err());

        let endpoint = EndpointConfig {
            url: Some("ftp://collector.example.com".to_string()),
            ..Default::default()
        };
        assert!(endpoint.validate().is_err());

        let endpoint = EndpointConfig {
            url: Some("https://collector.example.com".to_string()),
            read_timeout_secs: 0,
            ..Default::default()
        };
        assert!(endpoint.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_zero_batch_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[capture]\nlog_batch_limit = 0\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
