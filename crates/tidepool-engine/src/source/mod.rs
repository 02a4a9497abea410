//! Paginated SaaS source APIs

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::state::DateWindow;
use crate::tenant::TenantCredentials;

pub mod http;
pub mod memory;

pub use http::HttpSource;
pub use memory::MemorySource;

/// One offset-based page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub table: String,
    pub offset: u64,
    pub limit: u64,
    /// Sent as `updated_since` / `updated_before` when present
    pub window: Option<DateWindow>,
}

#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Number of records the source holds, if it can tell
    async fn count(
        &self,
        creds: &TenantCredentials,
        table: &str,
        window: Option<&DateWindow>,
    ) -> Result<Option<u64>>;

    /// Records in offset order; fewer than `limit` means the source is exhausted
    async fn fetch_page(&self, creds: &TenantCredentials, request: &PageRequest)
        -> Result<Vec<Value>>;
}
