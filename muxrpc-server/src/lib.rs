//! # muxrpc-server
//!
//! TCP server for muxrpc.
//!
//! This crate provides:
//! - Service registration with typed async method handlers
//! - A per-connection serving loop: sequential reads, concurrent handling,
//!   serialized response writes
//! - Per-request handle timeouts negotiated in the handshake
//! - An HTTP CONNECT upgrade path onto the same serving loop

pub mod error;
pub mod http;
pub mod server;
pub mod service;

pub use error::ServerError;
pub use server::{Server, ServerConfig, ServerStats};
pub use service::{Fault, MethodResult, Service, ServiceBuilder};
