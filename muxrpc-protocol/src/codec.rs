//! Value codecs negotiated in the connection handshake.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The encoding used for headers and bodies on one connection.
///
/// The identifier string travels in the handshake [`Options`](crate::Options)
/// so both ends agree before the first frame. This enum is the process-wide
/// identifier-to-implementation mapping; an identifier outside it fails the
/// handshake decode and the connection is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Self-describing JSON, the default.
    #[default]
    Json,
    /// MessagePack with named struct fields.
    Msgpack,
}

impl CodecKind {
    /// Encodes one value.
    pub fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Msgpack => Ok(rmp_serde::encode::to_vec_named(value)?),
        }
    }

    /// Decodes one value.
    pub fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
            CodecKind::Msgpack => Ok(rmp_serde::decode::from_slice(bytes)?),
        }
    }

    /// Encodes the placeholder body sent alongside an error response.
    pub fn empty_body(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode_value(&())
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Json => write!(f, "json"),
            CodecKind::Msgpack => write!(f, "msgpack"),
        }
    }
}
