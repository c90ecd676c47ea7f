//! # muxrpc-client
//!
//! Client library for muxrpc.
//!
//! This crate provides:
//! - A single-connection call multiplexer ([`Client`]): any number of
//!   concurrent calls over one stream, delivered back by sequence number
//! - A multi-server facade ([`XClient`]) with per-address connection
//!   caching, unicast selection, and first-reply-wins broadcast
//! - Service discovery, either from a static list or a polled registry

pub mod client;
pub mod discovery;
pub mod error;
pub mod xclient;

pub use client::{Call, Client};
pub use discovery::{
    Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode, DEFAULT_UPDATE_TTL,
};
pub use error::ClientError;
pub use xclient::{x_dial, XClient};
