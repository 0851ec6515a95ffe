use std::io;

use thiserror::Error;

/// Failures from the send path (C7).
#[derive(Error, Debug)]
pub enum SendError {
    #[error("session is stopped")]
    SessionStopped,
    #[error("write failed: {0}")]
    Io(#[source] io::Error),
    #[error("short write after retry exhaustion: sent {sent} of {total} bytes")]
    ShortWrite { sent: usize, total: usize },
}

/// Failures loading or applying [`crate::config::SessionConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("bind_addr {0:?} is not a valid socket address")]
    BadBindAddr(String),
}

/// Failures tearing a session down cleanly or accepting a new one.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Io(#[source] io::Error),
    #[error("peer address collision exhausted retries for {addr}")]
    PeerCollision { addr: std::net::SocketAddr },
    #[error("peer {addr} denied by access list")]
    AclDenied { addr: std::net::IpAddr },
}
