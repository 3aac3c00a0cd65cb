//! Configuration for the TeamSpeak exporter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Host or IP the HTTP endpoint listens on (default: "localhost").
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the HTTP endpoint listens on (default: 8010, 0 picks a free port).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// TeamSpeak server connection settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Poll loop settings.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Metric exposition settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_address() -> String {
    "localhost".to_string()
}

fn default_listen_port() -> u16 {
    8010
}

/// ServerQuery connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// ServerQuery address as `host:port` (default: "localhost:10011").
    #[serde(default = "default_server_address")]
    pub address: String,

    /// ServerQuery login name (default: "serveradmin").
    #[serde(default = "default_username")]
    pub username: String,

    /// ServerQuery login password.
    #[serde(default)]
    pub password: String,

    /// Virtual server to select after login (default: 1).
    #[serde(default = "default_server_id")]
    pub server_id: u32,
}

fn default_server_address() -> String {
    "localhost:10011".to_string()
}

fn default_username() -> String {
    "serveradmin".to_string()
}

fn default_server_id() -> u32 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            username: default_username(),
            password: String::new(),
            server_id: default_server_id(),
        }
    }
}

/// Poll loop timing and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between polls (default: 5).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Upper bound for a single ServerQuery command (default: 10).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// First retry delay after a failed poll (default: 1000).
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Largest retry delay (default: 60).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Consecutive failed polls before the exporter gives up.
    /// 0 retries forever, 1 exits on the first error.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    10
}

fn default_backoff_initial() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    5
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            command_timeout_secs: default_command_timeout(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            max_failures: default_max_failures(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

/// Metric exposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "teamspeak").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Upper bound on serving one scrape request (default: 10).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "teamspeak".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            prefix: default_prefix(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl MetricsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    ///
    /// Not validated here, so overrides can be applied first. Call
    /// [`ExporterConfig::validate`] once the final values are in place.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// The `host:port` the HTTP endpoint binds to.
    pub fn listen_addr(&self) -> String {
        if self.listen_address.contains(':') {
            format!("[{}]:{}", self.listen_address, self.listen_port)
        } else {
            format!("{}:{}", self.listen_address, self.listen_port)
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::Validation(
                "listen_address must not be empty".to_string(),
            ));
        }

        if self.server.address.is_empty() {
            return Err(ConfigError::Validation(
                "server address must not be empty".to_string(),
            ));
        }

        if self.polling.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "interval_secs must be > 0".to_string(),
            ));
        }

        if self.polling.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.polling.backoff_max() < self.polling.backoff_initial() {
            return Err(ConfigError::Validation(
                "backoff_max_secs must not be below backoff_initial_ms".to_string(),
            ));
        }

        // Validate path starts with /
        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if !is_valid_prefix(&self.metrics.prefix) {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: {}",
                self.metrics.prefix
            )));
        }

        if self.metrics.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            server: ServerConfig::default(),
            polling: PollingConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
