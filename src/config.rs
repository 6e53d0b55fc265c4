//! Multiplexing configuration.
//!
//! `MuxConfig` is the runtime form used by clients, servers and the pool.
//! `ConfigFile` is the TOML form read by the binaries; durations are plain
//! integers there.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipe::PipeOptions;

/// Session admission strategy of a client connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStrategy {
    /// Concurrent sessions per connection, 0 for unlimited
    pub max_concurrency: u32,
    /// Sessions a connection may ever originate before it retires, 0 for
    /// unlimited
    pub max_connection: u32,
}

/// Runtime multiplexing configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Client admission strategy
    pub strategy: ClientStrategy,
    /// Byte limit of each session's internal pipes, `None` for unbounded
    pub session_buffer: Option<usize>,
    /// How long a new session waits to fold its first payload into `New`
    pub first_payload_timeout: Duration,
    /// How long an empty client connection may linger in a pool
    pub idle_timeout: Duration,
    /// Interval between client keep-alive frames, `None` to disable
    pub keep_alive_interval: Option<Duration>,
    /// Pool maintenance interval
    pub cleanup_interval: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            strategy: ClientStrategy {
                max_concurrency: 8,
                max_connection: 0,
            },
            session_buffer: Some(64 * 1024),
            first_payload_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            cleanup_interval: Duration::from_secs(16),
        }
    }
}

impl MuxConfig {
    /// Pipe options for session-internal links.
    pub fn session_pipe(&self) -> PipeOptions {
        match self.session_buffer {
            Some(limit) => PipeOptions::with_limit(limit),
            None => PipeOptions::unbounded(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.first_payload_timeout.is_zero() {
            return Err(Error::config("first_payload_timeout must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::config("cleanup_interval must be positive"));
        }
        if self.keep_alive_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::config("keep_alive_interval must be positive"));
        }
        if self.strategy.max_concurrency > u16::MAX as u32 {
            return Err(Error::config("max_concurrency exceeds the session id space"));
        }
        Ok(())
    }
}

fn default_concurrency() -> u32 {
    8
}

fn default_buffer_kib() -> usize {
    64
}

fn default_first_payload_ms() -> u64 {
    100
}

fn default_idle_secs() -> u64 {
    30
}

fn default_cleanup_secs() -> u64 {
    16
}

/// `[mux]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfigFile {
    /// Concurrent sessions per connection, 0 for unlimited
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,
    /// Sessions per connection lifetime, 0 for unlimited
    #[serde(default)]
    pub max_connection: u32,
    /// Session pipe limit in KiB, 0 for handoff mode
    #[serde(default = "default_buffer_kib")]
    pub session_buffer_kib: usize,
    /// First payload wait (milliseconds)
    #[serde(default = "default_first_payload_ms")]
    pub first_payload_timeout_ms: u64,
    /// Idle connection lifetime (seconds)
    #[serde(default = "default_idle_secs")]
    pub idle_timeout_secs: u64,
    /// Keep-alive interval (seconds), 0 disables
    #[serde(default)]
    pub keep_alive_secs: u64,
    /// Pool maintenance interval (seconds)
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for MuxConfigFile {
    fn default() -> Self {
        Self::from_config(&MuxConfig::default())
    }
}

impl MuxConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<MuxConfig> {
        let config = MuxConfig {
            strategy: ClientStrategy {
                max_concurrency: self.max_concurrency,
                max_connection: self.max_connection,
            },
            session_buffer: Some(self.session_buffer_kib * 1024),
            first_payload_timeout: Duration::from_millis(self.first_payload_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keep_alive_interval: (self.keep_alive_secs > 0)
                .then(|| Duration::from_secs(self.keep_alive_secs)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            max_concurrency: config.strategy.max_concurrency,
            max_connection: config.strategy.max_connection,
            session_buffer_kib: config.session_buffer.map_or(0, |b| b / 1024),
            first_payload_timeout_ms: config.first_payload_timeout.as_millis() as u64,
            idle_timeout_secs: config.idle_timeout.as_secs(),
            keep_alive_secs: config.keep_alive_interval.map_or(0, |d| d.as_secs()),
            cleanup_interval_secs: config.cleanup_interval.as_secs(),
        }
    }
}

/// `[server]` section: where the demultiplexor listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address, `host:port`
    pub listen: String,
}

/// `[client]` section: local forwarder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Local listen address, `host:port`
    pub listen: String,
    /// Mux server address, `host:port`
    pub server: String,
    /// Target every forwarded connection is opened to, `host:port`
    pub target: String,
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Multiplexing parameters
    #[serde(default)]
    pub mux: MuxConfigFile,
    /// Server settings
    #[serde(default)]
    pub server: Option<ServerSection>,
    /// Client settings
    #[serde(default)]
    pub client: Option<ClientSection>,
}

impl ConfigFile {
    /// Parse TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }
}
