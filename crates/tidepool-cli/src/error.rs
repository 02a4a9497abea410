//! Error types for the Tidepool CLI

use thiserror::Error;
use tidepool_engine::IngestError;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Pipeline operation failed
    #[error(transparent)]
    Engine(#[from] IngestError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Could not read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] tidepool_common::TidepoolError),
}

impl CliError {
    /// Process exit code: 2 for problems the caller must fix, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(e) if e.is_config() => 2,
            CliError::Engine(_) => 1,
            CliError::InvalidArgument(_) | CliError::Read { .. } | CliError::Json(_) => 2,
            CliError::Logging(_) => 1,
        }
    }

    /// Whether the orchestrator should retry the task
    pub fn is_retryable(&self) -> bool {
        matches!(self, CliError::Engine(e) if e.is_retryable())
    }
}
