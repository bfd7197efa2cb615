//! Configuration management for the stream client
//!
//! Loads configuration from config.toml at startup.
//! All timing and reconnect parameters are configurable; durations are
//! given in milliseconds.

use crate::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Client configuration
///
/// Loaded from config.toml at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Connection and subscription settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Framing of data messages on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Multiplexed: `{"stream":"...","data":{...}}` on `<base>/stream`
    #[default]
    Combined,
    /// Single-stream: bare payloads on `<base>/ws`
    Raw,
}

impl StreamMode {
    /// Endpoint path for this mode
    pub fn path(&self) -> &'static str {
        match self {
            StreamMode::Combined => "stream",
            StreamMode::Raw => "ws",
        }
    }
}

/// Stream connection configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Server base URL (ws:// or wss://)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Combined (tagged) or raw framing
    #[serde(default)]
    pub mode: StreamMode,

    /// Wait for the server to acknowledge every command
    #[serde(default = "default_require_ack")]
    pub require_ack: bool,

    /// Interval between keepalive pings
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Max wait for a pong before the connection is considered lost
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    /// Upper bound for TCP + TLS + upgrade
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Max reconnect delay
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Randomized fraction of each reconnect delay (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Max wait for a command acknowledgement before resending
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Resends after the first attempt before a command is reported failed
    #[serde(default = "default_max_command_retries")]
    pub max_command_retries: u32,

    /// Payloads buffered per subscription before new ones are dropped
    #[serde(default = "default_delivery_queue_capacity")]
    pub delivery_queue_capacity: usize,

    /// Buffered client events per receiver
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Log output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write human-readable logs to stdout
    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            mode: StreamMode::default(),
            require_ack: default_require_ack(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_command_retries: default_max_command_retries(),
            delivery_queue_capacity: default_delivery_queue_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            console: default_console(),
        }
    }
}

fn default_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_require_ack() -> bool {
    true
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.5
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_max_command_retries() -> u32 {
    3
}

fn default_delivery_queue_capacity() -> usize {
    4096
}

fn default_event_capacity() -> usize {
    256
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

impl StreamConfig {
    /// Check values before a client is built from them
    ///
    /// # Errors
    /// `StreamError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StreamError::Config(msg));

        let url = Url::parse(&self.base_url)
            .map_err(|e| StreamError::Config(format!("base_url {:?}: {}", self.base_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return invalid(format!("base_url scheme must be ws or wss, got {}", url.scheme()));
        }

        let intervals = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_cap_ms", self.backoff_cap_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return invalid(format!("{} must be greater than zero", name));
        }

        if self.pong_timeout_ms >= self.ping_interval_ms {
            return invalid(format!(
                "pong_timeout_ms ({}) must be less than ping_interval_ms ({})",
                self.pong_timeout_ms, self.ping_interval_ms
            ));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return invalid(format!(
                "backoff_base_ms ({}) must not exceed backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return invalid(format!("backoff_jitter must be within 0.0..=1.0, got {}", self.backoff_jitter));
        }
        if self.delivery_queue_capacity == 0 {
            return invalid("delivery_queue_capacity must be greater than zero".to_string());
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Full endpoint URL for the configured mode
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.mode.path())
    }

    #[inline]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[inline]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[inline]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    #[inline]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the file named by `CONFIG_PATH` (default config.toml)
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: impl Into<PathBuf>) -> std::result::Result<Self, ConfigError> {
        let path = path.into();
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}

impl From<ConfigError> for StreamError {
    fn from(e: ConfigError) -> Self {
        StreamError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.base_url, "wss://fstream.binance.com");
        assert_eq!(config.stream.mode, StreamMode::Combined);
        assert!(config.stream.require_ack);
        assert_eq!(config.stream.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.stream.max_command_retries, 3);
        assert_eq!(config.stream.delivery_queue_capacity, 4096);
        assert_eq!(config.logging.dir, PathBuf::from("logs"));
        assert!(config.stream.validate().is_ok());
    }

    #[test]
    fn test_endpoint_per_mode() {
        let mut config = StreamConfig::default();
        assert_eq!(config.endpoint(), "wss://fstream.binance.com/stream");

        config.mode = StreamMode::Raw;
        config.base_url = "ws://127.0.0.1:9443/".to_string();
        assert_eq!(config.endpoint(), "ws://127.0.0.1:9443/ws");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [stream]
            mode = "raw"
            require_ack = false
            ping_interval_ms = 15000
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.mode, StreamMode::Raw);
        assert!(!config.stream.require_ack);
        assert_eq!(config.stream.ping_interval_ms, 15_000);
        assert_eq!(config.stream.pong_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_toml() {
        let result = Config::from_toml("[stream]\nmode = \"multiplexed\"");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from("does/not/exist/config.toml").unwrap();
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_validate_rejects() {
        let check = |f: fn(&mut StreamConfig)| {
            let mut config = StreamConfig::default();
            f(&mut config);
            config.validate()
        };

        assert!(matches!(check(|c| c.base_url = "https://x.com".into()), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.base_url = "not a url".into()), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.ping_interval_ms = 0), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.pong_timeout_ms = 30_000), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.backoff_base_ms = 120_000), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.backoff_jitter = 1.5), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.event_capacity = 0), Err(StreamError::Config(_))));
        assert!(matches!(check(|c| c.delivery_queue_capacity = 0), Err(StreamError::Config(_))));
    }
}
