//! # muxrpc-registry
//!
//! Service registry for muxrpc.
//!
//! This crate provides:
//! - A liveness-filtered server table keyed by service name and address
//! - The registry's HTTP surface (GET to list, POST to register or refresh,
//!   DELETE to remove)
//! - A heartbeat helper servers use to keep their entries alive
//! - Configuration for the standalone registry daemon

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod registry;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use heartbeat::heartbeat;
pub use http::{run_http, Registration};
pub use registry::{Registry, DEFAULT_TIMEOUT};
