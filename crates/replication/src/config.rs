use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, TransportError};

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_MAX_PEERS: usize = 32;
pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_CHANNEL_COUNT: u8 = 2;

/// Tuning for the datagram transport shared by server and client hosts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub channel_count: u8,
    /// A peer silent for this long is dropped.
    pub peer_timeout_ms: u64,
    /// Keepalive is sent after this much send silence.
    pub ping_interval_ms: u64,
    pub disconnect_grace_ms: u64,
    pub connect_retry_ms: u64,
    /// Reliable frames in flight per channel before new ones wait in a backlog.
    pub reliable_window: usize,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            peer_timeout_ms: 10_000,
            ping_interval_ms: 1_000,
            disconnect_grace_ms: 3_000,
            connect_retry_ms: 250,
            reliable_window: 256,
            min_rto_ms: 50,
            max_rto_ms: 2_000,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.channel_count == 0 {
            return Err(TransportError::InvalidConfig(
                "channel_count must be at least 1".into(),
            ));
        }
        if self.reliable_window == 0 || self.reliable_window > 1 << 15 {
            return Err(TransportError::InvalidConfig(format!(
                "reliable_window must be in 1..=32768, got {}",
                self.reliable_window
            )));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(TransportError::InvalidConfig(format!(
                "rto bounds {}..{} ms are invalid",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        if self.peer_timeout_ms <= self.ping_interval_ms {
            return Err(TransportError::InvalidConfig(
                "peer_timeout_ms must exceed ping_interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub max_peers: usize,
    pub tick_rate: u32,
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            tick_rate: DEFAULT_TICK_RATE,
            transport: TransportConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, max_peers: usize, tick_rate: u32) -> Self {
        Self {
            port,
            max_peers,
            tick_rate,
            ..Self::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub connect_timeout_ms: u64,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".into(),
            server_port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
