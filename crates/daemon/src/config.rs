//! Configuration management for the TermHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("idle_timeout_secs must be between 60 and 86400, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("reap_interval_secs must be between 5 and 3600, got {0}")]
    InvalidReapInterval(u64),

    #[error("max_transports must be between 1 and 64, got {0}")]
    InvalidMaxTransports(usize),

    #[error("read_timeout_ms must be between 50 and 30000, got {0}")]
    InvalidReadTimeout(u64),

    #[error("cache url must start with redis:// or rediss://, got {0}")]
    InvalidCacheUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Durable cache (session snapshot) configuration.
    pub cache: CacheConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// Shell streaming configuration.
    pub shell: ShellConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Durable cache configuration.
///
/// Snapshots are stored with a TTL equal to the session idle timeout, so a
/// record that outlives its session quietly expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL.
    pub url: String,

    /// When false the daemon runs with in-memory metadata only.
    pub enabled: bool,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Close sessions with no activity for this many seconds.
    pub idle_timeout_secs: u64,

    /// How often the idle reaper scans, in seconds.
    pub reap_interval_secs: u64,

    /// Upper bound on pooled transports.
    pub max_transports: usize,
}

/// Shell streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Terminal type requested for the PTY.
    pub term: String,

    /// Default terminal width in columns.
    pub cols: u16,

    /// Default terminal height in rows.
    pub rows: u16,

    /// Bounded-read timeout for the output loop, in milliseconds. Keeps the
    /// loop responsive to cancellation.
    pub read_timeout_ms: u64,

    /// Pause between idle output iterations, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            enabled: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 60,
            max_transports: 8,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            read_timeout_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reap interval as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl ShellConfig {
    /// Bounded-read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Idle poll pause as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_CACHE_URL: Override the durable cache URL
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TERMHUB_CACHE_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding cache url from environment: {}", url);
                self.cache.url = url;
            }
        }

        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.idle_timeout_secs < 60 || self.session.idle_timeout_secs > 86_400 {
            return Err(ConfigError::InvalidIdleTimeout(
                self.session.idle_timeout_secs,
            ));
        }

        if self.session.reap_interval_secs < 5 || self.session.reap_interval_secs > 3600 {
            return Err(ConfigError::InvalidReapInterval(
                self.session.reap_interval_secs,
            ));
        }

        if self.session.max_transports < 1 || self.session.max_transports > 64 {
            return Err(ConfigError::InvalidMaxTransports(
                self.session.max_transports,
            ));
        }

        if self.shell.read_timeout_ms < 50 || self.shell.read_timeout_ms > 30_000 {
            return Err(ConfigError::InvalidReadTimeout(self.shell.read_timeout_ms));
        }

        let url = &self.cache.url;
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::InvalidCacheUrl(url.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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
    ///
    /// The default path is `~/.config/termhub/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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
