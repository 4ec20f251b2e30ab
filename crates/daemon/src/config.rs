//! Configuration management for the ScreenRelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/screenrelay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client id used when a connection does not name one.
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("fps must be between 1 and 120, got {0}")]
    InvalidFps(u32),

    #[error("max_chunk_size must be between 1 and 65000, got {0}")]
    InvalidChunkSize(usize),

    #[error("write_timeout_ms must be greater than 0, got {0}")]
    InvalidWriteTimeout(u64),

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("default_client_id must not be empty")]
    EmptyClientId,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest chunk that still fits a UDP datagram alongside the fragment header.
const MAX_DATAGRAM_CHUNK: usize = 65_000;

/// Main configuration structure for the ScreenRelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// UDP signaling configuration.
    pub signaling: SignalingSettings,

    /// Frame streaming configuration.
    pub stream: StreamConfig,

    /// Frame capture configuration.
    pub capture: CaptureConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (default snapshot location).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// UDP signaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingSettings {
    /// Local address the signaling socket binds to.
    pub bind_addr: String,

    /// Peer address offers are sent to.
    pub remote_addr: String,

    /// Maximum chunk data size per datagram.
    pub max_chunk_size: usize,

    /// Delay between consecutive chunk sends, in milliseconds.
    pub chunk_pacing_ms: u64,

    /// How long to wait for an offer, in seconds.
    pub offer_timeout_secs: u64,

    /// How long to wait for an answer, in seconds.
    pub answer_timeout_secs: u64,

    /// How long an incomplete message may sit untouched, in seconds.
    pub pending_ttl_secs: u64,

    /// Maximum number of messages reassembled concurrently.
    pub max_pending_messages: usize,
}

/// Frame streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Address the WebSocket server listens on.
    pub listen_addr: String,

    /// Frames captured and dispatched per second.
    pub fps: u32,

    /// Deadline for a single frame write, in milliseconds.
    pub write_timeout_ms: u64,

    /// Split frames into chunk records of this many base64 characters.
    /// Zero sends each frame as one message.
    pub frame_chunk_size: usize,

    /// Client id assigned to connections that do not name one.
    pub default_client_id: String,

    /// Idle read deadline for client connections, in seconds.
    pub read_timeout_secs: u64,
}

/// Frame capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CaptureConfig {
    /// Snapshot file written by the external capture tool.
    /// Defaults to `<data_dir>/frame.jpg`.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            remote_addr: "192.168.1.16:8080".to_string(),
            max_chunk_size: protocol::MAX_CHUNK_SIZE,
            chunk_pacing_ms: 1,
            offer_timeout_secs: 60,
            answer_timeout_secs: 30,
            pending_ttl_secs: 60,
            max_pending_messages: protocol::DEFAULT_MAX_PENDING,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8090".to_string(),
            fps: 10,
            write_timeout_ms: 5_000,
            frame_chunk_size: 0,
            default_client_id: DEFAULT_CLIENT_ID.to_string(),
            read_timeout_secs: 60,
        }
    }
}

impl SignalingSettings {
    /// Parsed local bind address.
    pub fn bind_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("signaling.bind_addr", &self.bind_addr)
    }

    /// Parsed remote peer address.
    pub fn remote_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("signaling.remote_addr", &self.remote_addr)
    }

    /// Delay between consecutive chunk sends.
    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    /// Deadline for receiving an offer.
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    /// Deadline for receiving an answer.
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    /// TTL for incomplete messages.
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

impl StreamConfig {
    /// Parsed WebSocket listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("stream.listen_addr", &self.listen_addr)
    }

    /// Interval between dispatch ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Deadline for a single frame write.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Idle read deadline for client connections.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Chunk size for the chunked frame variant, if enabled.
    pub fn frame_chunking(&self) -> Option<usize> {
        (self.frame_chunk_size > 0).then_some(self.frame_chunk_size)
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenrelay")
}

/// Interprets common truthy spellings.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Replaces the host part of `host:port`, keeping the port.
fn with_loopback_host(addr: &str) -> String {
    let port = addr.rsplit_once(':').map(|(_, port)| port).unwrap_or("8080");
    format!("127.0.0.1:{}", port)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SCREENRELAY_LOG_LEVEL: Override log level
    /// - SCREENRELAY_LOCAL_ADDR: Override signaling bind address
    /// - SCREENRELAY_REMOTE_ADDR: Override signaling peer address
    /// - SCREENRELAY_BIND_LOCALHOST_ONLY: Bind signaling to 127.0.0.1
    /// - SCREENRELAY_LISTEN_ADDR: Override WebSocket listen address
    /// - SCREENRELAY_FPS: Override frame rate
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("SCREENRELAY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(addr) = non_empty_env("SCREENRELAY_LOCAL_ADDR") {
            tracing::info!("Overriding signaling bind_addr from environment: {}", addr);
            self.signaling.bind_addr = addr;
        } else if non_empty_env("SCREENRELAY_BIND_LOCALHOST_ONLY").is_some_and(|v| is_truthy(&v)) {
            self.signaling.bind_addr = with_loopback_host(&self.signaling.bind_addr);
            tracing::info!(
                "Binding signaling to loopback only: {}",
                self.signaling.bind_addr
            );
        }

        if let Some(addr) = non_empty_env("SCREENRELAY_REMOTE_ADDR") {
            tracing::info!("Overriding signaling remote_addr from environment: {}", addr);
            self.signaling.remote_addr = addr;
        }

        if let Some(addr) = non_empty_env("SCREENRELAY_LISTEN_ADDR") {
            tracing::info!("Overriding stream listen_addr from environment: {}", addr);
            self.stream.listen_addr = addr;
        }

        if let Some(fps) = non_empty_env("SCREENRELAY_FPS") {
            match fps.parse() {
                Ok(fps) => self.stream.fps = fps,
                Err(_) => tracing::warn!("Ignoring invalid SCREENRELAY_FPS value: {}", fps),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.fps < 1 || self.stream.fps > 120 {
            return Err(ConfigError::InvalidFps(self.stream.fps));
        }

        let chunk = self.signaling.max_chunk_size;
        if chunk < 1 || chunk > MAX_DATAGRAM_CHUNK {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.stream.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidWriteTimeout(self.stream.write_timeout_ms));
        }

        self.signaling.bind_socket_addr()?;
        self.signaling.remote_socket_addr()?;
        self.stream.listen_socket_addr()?;

        if self.stream.default_client_id.trim().is_empty() {
            return Err(ConfigError::EmptyClientId);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Snapshot file the capture source reads.
    pub fn snapshot_path(&self) -> PathBuf {
        self.capture
            .snapshot_path
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("frame.jpg"))
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

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
