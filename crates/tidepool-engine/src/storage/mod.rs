//! Object storage for raw and canonical files

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod config;
pub mod jsonl;
pub mod keys;
pub mod memory;
pub mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Size and modification time of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

pub const CONTENT_TYPE_JSONL: &str = "application/x-ndjson";
pub const CONTENT_TYPE_PARQUET: &str = "application/vnd.apache.parquet";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (or overwrite) one object
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<ObjectMeta>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// `None` when the key does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Every object under `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}
