//! Engine error taxonomy
//!
//! Every failure is classified so callers know whether to retry the unit,
//! record it as terminal, or skip it and continue with the batch.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised by engine components
#[derive(Error, Debug)]
pub enum IngestError {
    /// Bad dates, missing credentials or mappings. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network timeouts, throttling, storage hiccups. Retried with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The source API rejected the request
    #[error("Source API error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, IngestError::Config(_))
    }

    /// Classify an HTTP status returned by a remote service
    pub fn from_status(status: reqwest::StatusCode, context: &str, body: &str) -> Self {
        let snippet: String = body.chars().take(512).collect();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            IngestError::Transient(format!("{} returned {}: {}", context, status, snippet))
        } else {
            IngestError::Source(format!("{} returned {}: {}", context, status, snippet))
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return IngestError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                IngestError::Transient(err.to_string())
            },
            _ => IngestError::Source(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                IngestError::Transient(format!("state store unavailable: {}", err))
            },
            other => IngestError::State(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IngestError::State(format!("migration failed: {}", err))
    }
}

impl From<parquet::errors::ParquetError> for IngestError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        IngestError::Parquet(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for IngestError {
    fn from(err: arrow::error::ArrowError) -> Self {
        IngestError::Parquet(err.to_string())
    }
}

impl From<tidepool_common::TidepoolError> for IngestError {
    fn from(err: tidepool_common::TidepoolError) -> Self {
        use tidepool_common::TidepoolError;
        match err {
            TidepoolError::Io(e) => IngestError::Io(e),
            TidepoolError::Serialization(e) => IngestError::Serialization(e),
            TidepoolError::Config(msg) | TidepoolError::Logging(msg) => IngestError::Config(msg),
        }
    }
}
