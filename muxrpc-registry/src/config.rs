//! Registry daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MUXRPC_REGISTRY_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the standalone registry daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// HTTP path the registry answers on.
    pub path: String,
    /// Seconds without a heartbeat before an entry expires. Zero disables
    /// expiry.
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9999".parse().unwrap(),
            path: muxrpc_protocol::DEFAULT_REGISTRY_PATH.to_string(),
            timeout_secs: 300,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, String),
}

impl RegistryConfig {
    /// Loads configuration from file, then applies environment variable
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("MUXRPC_REGISTRY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: RegistryConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MUXRPC_REGISTRY_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(path) = std::env::var("MUXRPC_REGISTRY_PATH") {
            self.path = path;
        }
        if let Ok(timeout) = std::env::var("MUXRPC_REGISTRY_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.timeout_secs = secs;
            }
        }
    }

    /// Returns the entry timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.path, muxrpc_protocol::DEFAULT_REGISTRY_PATH);
        assert_eq!(config.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = "bind_addr: \"0.0.0.0:7700\"\ntimeout_secs: 30\n";
        let config: RegistryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_addr.port(), 7700);
        assert_eq!(config.timeout_secs, 30);
        // Unset fields keep their defaults.
        assert_eq!(config.path, muxrpc_protocol::DEFAULT_REGISTRY_PATH);
    }
}
