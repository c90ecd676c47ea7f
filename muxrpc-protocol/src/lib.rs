//! # muxrpc-protocol
//!
//! Wire protocol implementation for muxrpc.
//!
//! This crate provides:
//! - The JSON-line connection handshake ([`Options`])
//! - Length-delimited unit framing over any stream transport
//! - Pluggable value codecs ([`CodecKind`]: JSON, MessagePack)
//! - The per-call [`Header`] shared by requests and responses

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::CodecKind;
pub use error::ProtocolError;
pub use frame::{Decoder, FrameReader, FrameWriter, MAX_UNIT_SIZE, UNIT_PREFIX_SIZE};
pub use message::{Header, Options, MAGIC};

/// Default path a server answers RPC CONNECT upgrades on.
pub const DEFAULT_RPC_PATH: &str = "/_muxrpc_";

/// Default path of the standalone registry's HTTP surface.
pub const DEFAULT_REGISTRY_PATH: &str = "/_muxrpc_/registry";
