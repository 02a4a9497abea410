//! Error types shared across Tidepool crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, TidepoolError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum TidepoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
