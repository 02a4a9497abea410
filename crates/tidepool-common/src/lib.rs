//! Tidepool Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and hashing used by every Tidepool workspace member.
//!
//! - **Error Handling**: [`TidepoolError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Hashing**: content hashes for canonical records and stored objects
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use tidepool_common::hashing::record_hash;
//!
//! let fields = json!({ "id": "42", "name": "Acme" });
//! let hash = record_hash(fields.as_object().unwrap());
//! assert_eq!(hash.len(), 64);
//! ```

pub mod error;
pub mod hashing;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, TidepoolError};
