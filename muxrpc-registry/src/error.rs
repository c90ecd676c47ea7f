//! Registry error types.

use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
}
