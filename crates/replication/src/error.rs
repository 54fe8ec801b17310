use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::net::HostMode;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotInitialized,
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("no host created")]
    NoHost,
    #[error("{operation} is not valid on a {mode} host")]
    WrongMode {
        operation: &'static str,
        mode: HostMode,
    },
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("connection refused: {reason}")]
    Refused { reason: String },
    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server not initialized")]
    NotInitialized,
    #[error("tick loop is running; stop it before ticking manually")]
    Running,
    #[error("tick rate must be between 1 and 1000 Hz, got {0}")]
    InvalidTickRate(u32),
    #[error("failed to spawn tick thread: {0}")]
    Spawn(io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("client not initialized")]
    NotInitialized,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
