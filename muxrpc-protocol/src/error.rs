//! Protocol error types.

use thiserror::Error;

/// Errors raised by framing, the handshake, or value codecs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unit too large: {size} bytes (max {max})")]
    UnitTooLarge { size: usize, max: usize },

    #[error("connection closed mid-frame")]
    ConnectionClosed,

    #[error("invalid magic number: {0:#x}")]
    BadMagic(u32),

    #[error("invalid UTF-8 in handshake line")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("malformed service method name: {0:?}")]
    BadServiceMethod(String),
}
