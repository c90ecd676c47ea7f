//! Handshake options and the per-call header.

use crate::codec::CodecKind;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Magic number opening every connection.
pub const MAGIC: u32 = 0x3bef5c;

/// Default connect timeout (10 seconds).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Connection handshake, sent by the client as one JSON line before any
/// framed traffic.
///
/// The handshake is always JSON regardless of the negotiated codec, so the
/// codec identifier itself is readable before the binary framing begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Must equal [`MAGIC`].
    pub magic: u32,

    /// Codec for every header and body after the handshake.
    #[serde(default)]
    pub codec: CodecKind,

    /// Client-side dial timeout in milliseconds. Zero waits forever.
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// Server-side handling timeout per request in milliseconds.
    /// Zero lets handlers run unbounded.
    #[serde(default)]
    pub handle_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            codec: CodecKind::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handle_timeout_ms: 0,
        }
    }
}

impl Options {
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the handle timeout as a Duration.
    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_timeout_ms)
    }

    /// Serializes the handshake line (without the trailing newline).
    pub fn to_line(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a handshake line and validates the magic number.
    ///
    /// An unknown codec identifier fails serde deserialization here, which
    /// is how an unsupported codec rejects the connection.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let options: Options = serde_json::from_str(line)?;
        if options.magic != MAGIC {
            return Err(ProtocolError::BadMagic(options.magic));
        }
        Ok(options)
    }
}

/// Per-call header, shared by requests and responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    /// `"Service.Method"`, exactly one dot.
    pub service_method: String,

    /// Sequence number chosen by the client, monotonic from 1.
    pub seq: u64,

    /// Empty on success; a response with a non-empty error carries a
    /// placeholder body.
    #[serde(default)]
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Splits `service_method` into service and method names.
    pub fn split_name(&self) -> Result<(&str, &str), ProtocolError> {
        split_service_method(&self.service_method)
    }
}

/// Splits `"Service.Method"` into its two segments.
///
/// Exactly one dot is required; anything else is malformed.
pub fn split_service_method(name: &str) -> Result<(&str, &str), ProtocolError> {
    let mut parts = name.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(ProtocolError::BadServiceMethod(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_line_roundtrip() {
        let options = Options::default()
            .with_codec(CodecKind::Msgpack)
            .with_handle_timeout(Duration::from_secs(1));

        let line = options.to_line().unwrap();
        let text = std::str::from_utf8(&line).unwrap();
        let back = Options::from_line(text).unwrap();

        assert_eq!(back.magic, MAGIC);
        assert_eq!(back.codec, CodecKind::Msgpack);
        assert_eq!(back.handle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let result = Options::from_line(r#"{"magic":12345,"codec":"json"}"#);
        assert!(matches!(result, Err(ProtocolError::BadMagic(12345))));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let line = format!(r#"{{"magic":{},"codec":"gob"}}"#, MAGIC);
        assert!(Options::from_line(&line).is_err());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let line = format!(r#"{{"magic":{}}}"#, MAGIC);
        let options = Options::from_line(&line).unwrap();
        assert_eq!(options.codec, CodecKind::Json);
        assert_eq!(options.handle_timeout_ms, 0);
    }

    #[test]
    fn test_split_service_method() {
        assert_eq!(split_service_method("Arith.Sum").unwrap(), ("Arith", "Sum"));

        for bad in ["Arith", "Arith.Sum.Extra", ".Sum", "Arith.", ""] {
            assert!(split_service_method(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_header_roundtrip_under_both_codecs() {
        let header = Header::request("Arith.Sum", 42);
        for kind in [CodecKind::Json, CodecKind::Msgpack] {
            let bytes = kind.encode_value(&header).unwrap();
            let back: Header = kind.decode_value(&bytes).unwrap();
            assert_eq!(back.service_method, "Arith.Sum");
            assert_eq!(back.seq, 42);
            assert!(back.error.is_empty());
        }
    }
}
