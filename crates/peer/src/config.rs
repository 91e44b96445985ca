//! Configuration management for SecureChat peers.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/securechat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use securechat_protocol::channel::{
    ChannelConfig, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REPLAY_CACHE_SIZE,
};
use securechat_protocol::validation::is_valid_display_name;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::RelayConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("display_name must be 3-20 characters of letters, digits or underscore, got {0:?}")]
    InvalidDisplayName(String),

    #[error("key_exchange_timeout must be between 1 and 300 seconds, got {0}")]
    InvalidKeyExchangeTimeout(u64),

    #[error("send_timeout must be between 1 and 300 seconds, got {0}")]
    InvalidSendTimeout(u64),

    #[error("max_message_size must be between 1 and 1048576 bytes, got {0}")]
    InvalidMaxMessageSize(usize),

    #[error("replay_window must be between 1 and 3600 seconds, got {0}")]
    InvalidReplayWindow(u64),

    #[error("replay_cache_size must be between 1 and 100000, got {0}")]
    InvalidReplayCacheSize(usize),

    #[error("event_capacity must be between 1 and 65536, got {0}")]
    InvalidEventCapacity(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest configurable message size (1 MiB).
const MAX_MESSAGE_SIZE_LIMIT: usize = 1024 * 1024;

/// Display name used when none is configured and `$USER` is unusable.
const FALLBACK_DISPLAY_NAME: &str = "guest";

/// Main configuration structure for a SecureChat peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Who this peer is and how it logs.
    pub identity: IdentityConfig,

    /// Channel limits and timeouts.
    pub channel: ChannelSettings,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name shown to the peer as the sender of messages.
    pub display_name: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Channel configuration, in seconds and bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    /// Seconds to wait for a key offer to be acknowledged.
    pub key_exchange_timeout: u64,

    /// Seconds to wait for a message to be acknowledged.
    pub send_timeout: u64,

    /// Largest message in bytes.
    pub max_message_size: usize,

    /// Tolerated clock skew of incoming messages, in seconds.
    pub replay_window: u64,

    /// Number of message ids remembered for replay detection.
    pub replay_cache_size: usize,

    /// Capacity of the channel event queue.
    pub event_capacity: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            key_exchange_timeout: 10,
            send_timeout: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            replay_window: 30,
            replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("securechat")
        .join("config.toml")
}

/// Returns `$USER` if it is a usable display name, otherwise `guest`.
fn default_display_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|name| is_valid_display_name(name))
        .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SECURECHAT_DISPLAY_NAME: Override display name
    /// - SECURECHAT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("SECURECHAT_DISPLAY_NAME") {
            if !name.is_empty() {
                tracing::info!("Overriding display_name from environment: {}", name);
                self.identity.display_name = name;
            }
        }

        if let Ok(level) = std::env::var("SECURECHAT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.identity.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_display_name(&self.identity.display_name) {
            return Err(ConfigError::InvalidDisplayName(
                self.identity.display_name.clone(),
            ));
        }

        let channel = &self.channel;
        if !(1..=300).contains(&channel.key_exchange_timeout) {
            return Err(ConfigError::InvalidKeyExchangeTimeout(
                channel.key_exchange_timeout,
            ));
        }

        if !(1..=300).contains(&channel.send_timeout) {
            return Err(ConfigError::InvalidSendTimeout(channel.send_timeout));
        }

        if !(1..=MAX_MESSAGE_SIZE_LIMIT).contains(&channel.max_message_size) {
            return Err(ConfigError::InvalidMaxMessageSize(channel.max_message_size));
        }

        if !(1..=3600).contains(&channel.replay_window) {
            return Err(ConfigError::InvalidReplayWindow(channel.replay_window));
        }

        if !(1..=100_000).contains(&channel.replay_cache_size) {
            return Err(ConfigError::InvalidReplayCacheSize(channel.replay_cache_size));
        }

        if !(1..=65_536).contains(&channel.event_capacity) {
            return Err(ConfigError::InvalidEventCapacity(channel.event_capacity));
        }

        let level = self.identity.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.identity.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Builds the channel configuration for this peer.
    pub fn into_channel_config(&self) -> ChannelConfig {
        self.channel_config_for(&self.identity.display_name)
    }

    /// Builds a channel configuration with these limits for another name.
    pub fn channel_config_for(&self, display_name: &str) -> ChannelConfig {
        let channel = &self.channel;
        ChannelConfig::new(display_name)
            .with_key_exchange_timeout(Duration::from_secs(channel.key_exchange_timeout))
            .with_send_timeout(Duration::from_secs(channel.send_timeout))
            .with_max_message_size(channel.max_message_size)
            .with_replay_window(Duration::from_secs(channel.replay_window))
            .with_replay_cache_size(channel.replay_cache_size)
            .with_event_capacity(channel.event_capacity)
    }

    /// Builds relay settings matching the channel limits.
    pub fn relay_config(&self) -> RelayConfig {
        let channel = &self.channel;
        RelayConfig::default()
            .with_max_message_size(channel.max_message_size)
            .with_replay_window(Duration::from_secs(channel.replay_window))
            .with_replay_cache_size(channel.replay_cache_size)
            .with_inbox_capacity(channel.event_capacity)
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
