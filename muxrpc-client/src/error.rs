//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] muxrpc_protocol::ProtocolError),

    #[error("connection is shut down")]
    Shutdown,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("server error: {0}")]
    Server(String),

    #[error("http upgrade refused: {0}")]
    HttpUpgrade(String),

    #[error("malformed rpc address {0:?}, expected network@host:port")]
    BadAddress(String),

    #[error("no available servers")]
    NoAvailableServers,

    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),
}
