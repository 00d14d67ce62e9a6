//! Configuration management for the NSQ client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nsq-client/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::connection::ConnectionOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("nsqd host must not be empty")]
    EmptyHost,

    #[error("nsqd port must not be 0")]
    InvalidPort,

    #[error("max_in_flight must be at least 1, got {0}")]
    InvalidMaxInFlight(u64),

    #[error("msg_timeout_ms must be between 1000 and 900000, got {0}")]
    InvalidMsgTimeout(u64),

    #[error("heartbeat_interval_ms must be between 1000 and 60000, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("retry base_ms must be greater than 0 and at most cap_ms ({cap_ms}), got {base_ms}")]
    InvalidRetryDelays { base_ms: u64, cap_ms: u64 },

    #[error("retry max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the NSQ client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Daemon address.
    pub nsqd: NsqdConfig,

    /// Consumer settings.
    pub consumer: ConsumerConfig,

    /// Values requested in IDENTIFY.
    pub identify: IdentifySection,

    /// Reconnection backoff.
    pub retry: RetrySection,

    /// Client-side settings.
    pub client: ClientConfig,
}

/// Daemon address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NsqdConfig {
    pub host: String,
    pub port: u16,
}

/// Consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Credit ceiling granted to the daemon.
    pub max_in_flight: u64,

    /// Message timeout requested from the daemon, in milliseconds.
    pub msg_timeout_ms: u64,
}

/// Values requested in IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentifySection {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

/// Reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

/// Client-side settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for NsqdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4150,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            msg_timeout_ms: protocol::DEFAULT_MSG_TIMEOUT_MS,
        }
    }
}

impl Default for IdentifySection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: protocol::DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_ms: policy.base.as_millis() as u64,
            cap_ms: policy.cap.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl RetrySection {
    /// Builds the policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_base(Duration::from_millis(self.base_ms))
            .with_cap(Duration::from_millis(self.cap_ms))
            .with_max_attempts(self.max_attempts)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nsq-client")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NSQ_NSQD_HOST: Override daemon host
    /// - NSQ_NSQD_PORT: Override daemon port (ignored if not a valid port)
    /// - NSQ_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NSQ_NSQD_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding nsqd host from environment: {}", host);
                self.nsqd.host = host;
            }
        }

        if let Ok(port) = std::env::var("NSQ_NSQD_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding nsqd port from environment: {}", port);
                    self.nsqd.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(_) => tracing::warn!("Ignoring invalid NSQ_NSQD_PORT: {:?}", port),
            }
        }

        if let Ok(level) = std::env::var("NSQ_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nsqd.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.nsqd.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.consumer.max_in_flight == 0 {
            return Err(ConfigError::InvalidMaxInFlight(self.consumer.max_in_flight));
        }

        // Range the daemon accepts by default for a client-requested timeout
        if !(1_000..=900_000).contains(&self.consumer.msg_timeout_ms) {
            return Err(ConfigError::InvalidMsgTimeout(self.consumer.msg_timeout_ms));
        }

        if !(1_000..=60_000).contains(&self.identify.heartbeat_interval_ms) {
            return Err(ConfigError::InvalidHeartbeatInterval(
                self.identify.heartbeat_interval_ms,
            ));
        }

        if self.retry.base_ms == 0 || self.retry.base_ms > self.retry.cap_ms {
            return Err(ConfigError::InvalidRetryDelays {
                base_ms: self.retry.base_ms,
                cap_ms: self.retry.cap_ms,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Connection options matching this configuration.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default()
            .with_max_in_flight(self.consumer.max_in_flight)
            .with_msg_timeout(Duration::from_millis(self.consumer.msg_timeout_ms))
            .with_heartbeat_interval(Duration::from_millis(self.identify.heartbeat_interval_ms))
            .with_retry(self.retry.policy())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
