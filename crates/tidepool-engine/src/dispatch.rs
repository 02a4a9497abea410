//! Compute-to-compute invocation
//!
//! Fire-and-forget handoffs between pipeline stages. The aggregator hands raw
//! files to the canonical transformer, and the transformer hands canonical
//! files to the merge engine. Each request carries the exact file list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::mapping::ScdType;

/// Ask the canonical transformer to process raw files of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    /// Exact raw keys. `None` lists raw storage for the table instead.
    #[serde(default)]
    pub files: Option<Vec<String>>,
    /// Ignore the last-transformed watermark when listing
    #[serde(default)]
    pub force_reprocess: bool,
}

/// Ask the merge engine to load canonical files into one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub tenant_id: String,
    pub canonical_table: String,
    pub files: Vec<String>,
    /// Resolved from the mapping when absent
    #[serde(default)]
    pub scd_type: Option<ScdType>,
}

/// A request as written to the outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchRequest {
    Transform(TransformRequest),
    Merge(MergeRequest),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch_transform(&self, request: TransformRequest) -> Result<()>;

    async fn dispatch_merge(&self, request: MergeRequest) -> Result<()>;
}

/// Writes each request as a JSON file in an outbox directory for an external
/// invoker to pick up.
///
/// Files are written under a temporary name and renamed, so a reader never
/// sees a partial request.
pub struct QueueDispatcher {
    outbox_dir: PathBuf,
}

impl QueueDispatcher {
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
        }
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }

    async fn enqueue(&self, request: &DispatchRequest) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.outbox_dir).await?;

        let kind = match request {
            DispatchRequest::Transform(_) => "transform",
            DispatchRequest::Merge(_) => "merge",
        };
        let name = format!(
            "{}-{}-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            kind,
            Uuid::new_v4()
        );
        let path = self.outbox_dir.join(&name);
        let tmp = self.outbox_dir.join(format!(".{}.tmp", name));

        let body = serde_json::to_vec_pretty(request)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(path)
    }

    /// Read a request file written by [`QueueDispatcher`]
    pub async fn read_request(path: &Path) -> Result<DispatchRequest> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            IngestError::Config(format!("request file {} is malformed: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, table = %request.table_name))]
    async fn dispatch_transform(&self, request: TransformRequest) -> Result<()> {
        let files = request.files.as_ref().map(Vec::len);
        let path = self.enqueue(&DispatchRequest::Transform(request)).await?;
        info!(path = %path.display(), files = ?files, "Queued transform request");
        Ok(())
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, table = %request.canonical_table))]
    async fn dispatch_merge(&self, request: MergeRequest) -> Result<()> {
        let files = request.files.len();
        let path = self.enqueue(&DispatchRequest::Merge(request)).await?;
        info!(path = %path.display(), files, "Queued merge request");
        Ok(())
    }
}

/// Keeps every request in memory
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<DispatchRequest>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn transforms(&self) -> Vec<TransformRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                DispatchRequest::Transform(t) => Some(t),
                DispatchRequest::Merge(_) => None,
            })
            .collect()
    }

    pub fn merges(&self) -> Vec<MergeRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                DispatchRequest::Merge(m) => Some(m),
                DispatchRequest::Transform(_) => None,
            })
            .collect()
    }

    fn record(&self, request: DispatchRequest) -> Result<()> {
        self.requests
            .lock()
            .map_err(|_| IngestError::Internal("dispatcher lock poisoned".into()))?
            .push(request);
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch_transform(&self, request: TransformRequest) -> Result<()> {
        self.record(DispatchRequest::Transform(request))
    }

    async fn dispatch_merge(&self, request: MergeRequest) -> Result<()> {
        self.record(DispatchRequest::Merge(request))
    }
}
