//! Chunk processor
//!
//! Executes one chunk: a sequential page loop bounded by a [`Deadline`]. On
//! expiry the records fetched so far are flushed and a continuation offset is
//! recorded; the next invocation resumes exactly there. A failed page discards
//! everything fetched in this invocation, so no partial segment is ever
//! written. Progress is persisted after every invocation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::deadline::Deadline;
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use crate::source::{PageRequest, SourceApi};
use crate::state::{ChunkProgress, ChunkStatus, ContinuationState, StateStore};
use crate::storage::keys::raw_segment_key;
use crate::storage::{jsonl, ObjectStore, CONTENT_TYPE_JSONL};
use crate::tenant::TenantResolver;

/// Result of one chunk invocation. Counts and files are cumulative across
/// invocations of the same chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub job_id: Uuid,
    pub chunk_id: u32,
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    pub status: ChunkStatus,
    pub records_fetched: u64,
    pub files: Vec<String>,
    pub continuation: Option<ContinuationState>,
    pub error: Option<String>,
}

impl ChunkOutcome {
    pub fn from_progress(chunk: &ChunkProgress) -> Self {
        Self {
            job_id: chunk.job_id,
            chunk_id: chunk.chunk_id,
            tenant_id: chunk.tenant_id.clone(),
            service: chunk.service.clone(),
            table_name: chunk.table_name.clone(),
            status: chunk.status,
            records_fetched: chunk.records_processed,
            files: chunk.output_files.clone(),
            continuation: chunk.continuation,
            error: chunk.last_error.clone(),
        }
    }
}

/// Page size for the remaining part of a chunk
pub fn page_size(remaining: u64, min: u64, max: u64) -> u64 {
    remaining.clamp(min, max)
}

pub struct ChunkProcessor {
    state: Arc<dyn StateStore>,
    objects: Arc<dyn ObjectStore>,
    source: Arc<dyn SourceApi>,
    resolver: Arc<TenantResolver>,
    retry: RetryPolicy,
    min_page_size: u64,
    max_page_size: u64,
    max_records_per_chunk: u64,
}

impl ChunkProcessor {
    pub fn new(
        state: Arc<dyn StateStore>,
        objects: Arc<dyn ObjectStore>,
        source: Arc<dyn SourceApi>,
        resolver: Arc<TenantResolver>,
        retry: RetryPolicy,
        chunking: &ChunkingConfig,
    ) -> Self {
        Self {
            state,
            objects,
            source,
            resolver,
            retry,
            min_page_size: chunking.min_page_size,
            max_page_size: chunking.max_page_size,
            max_records_per_chunk: chunking.max_records_per_chunk,
        }
    }

    #[instrument(skip(self, deadline), fields(remaining_ms = deadline.remaining().as_millis() as u64))]
    pub async fn process(
        &self,
        job_id: Uuid,
        chunk_id: u32,
        deadline: &Deadline,
    ) -> Result<ChunkOutcome> {
        let mut chunk = self.state.get_chunk(job_id, chunk_id).await?.ok_or_else(|| {
            IngestError::Config(format!("chunk {} of job {} does not exist", chunk_id, job_id))
        })?;

        if chunk.status == ChunkStatus::Completed {
            debug!("Chunk already completed");
            return Ok(ChunkOutcome::from_progress(&chunk));
        }

        let job = self
            .state
            .get_job(job_id)
            .await?
            .ok_or_else(|| IngestError::State(format!("job {} does not exist", job_id)))?;

        chunk.invocations += 1;

        let creds = match self.resolver.resolve(&chunk.tenant_id, &chunk.service).await.and_then(
            |creds| {
                creds.ensure_endpoint_enabled(&chunk.table_name)?;
                Ok(creds)
            },
        ) {
            Ok(creds) => creds,
            Err(e) => {
                self.mark_failed(&mut chunk, &e).await?;
                return Err(e);
            },
        };

        let start = chunk.resume_offset();
        let end = chunk.end_offset;
        let mut current = start;
        let mut buffer: Vec<Value> = Vec::new();
        let mut timed_out = false;
        let mut exhausted = false;

        while current < end {
            if deadline.is_expired() {
                timed_out = true;
                break;
            }

            let remaining = end - current;
            let limit = page_size(remaining, self.min_page_size, self.max_page_size);
            let request = PageRequest {
                table: chunk.table_name.clone(),
                offset: current,
                limit,
                window: chunk.window,
            };

            let mut page = match self
                .retry
                .run("fetch page", |_| self.source.fetch_page(&creds, &request))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        offset = current,
                        discarded = buffer.len(),
                        error = %e,
                        "Page fetch failed, discarding chunk progress from this invocation"
                    );
                    drop(buffer);
                    self.mark_failed(&mut chunk, &e).await?;
                    return Ok(ChunkOutcome::from_progress(&chunk));
                },
            };

            let fetched = page.len() as u64;
            // Never read into the next chunk's range. An open-ended chunk has
            // no neighbour, so it keeps the whole page.
            if !chunk.open_ended {
                page.truncate(remaining.min(fetched) as usize);
            }
            current += page.len() as u64;
            buffer.extend(page);

            debug!(offset = request.offset, fetched, "Fetched page");

            if fetched < limit {
                exhausted = true;
                break;
            }
        }

        // A full last page at the cap means the source may hold more
        let extend = chunk.open_ended && !timed_out && !exhausted && current >= end;

        if !buffer.is_empty() {
            let key = raw_segment_key(
                &chunk.tenant_id,
                &chunk.service,
                &chunk.table_name,
                job.created_at,
                chunk.chunk_id,
                start,
            );
            let written = match jsonl::encode(&buffer) {
                Ok(body) => {
                    self.retry
                        .run("write raw segment", |_| {
                            self.objects.put(&key, body.clone(), CONTENT_TYPE_JSONL)
                        })
                        .await
                },
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(key = %key, error = %e, "Failed to write raw segment");
                self.mark_failed(&mut chunk, &e).await?;
                return Ok(ChunkOutcome::from_progress(&chunk));
            }

            chunk.records_processed += buffer.len() as u64;
            if !chunk.output_files.contains(&key) {
                chunk.output_files.push(key);
            }
        }

        let flushed = buffer.len();
        drop(buffer);

        if extend {
            chunk.end_offset = current + self.max_records_per_chunk.max(1);
            info!(
                offset = current,
                new_end_offset = chunk.end_offset,
                "Chunk reached its cap with more records pending, extending"
            );
        }

        if timed_out || extend {
            chunk.status = ChunkStatus::TimeoutContinuation;
            chunk.continuation = Some(ContinuationState {
                current_offset: current,
                remaining_records: chunk.end_offset.saturating_sub(current),
            });
        } else {
            chunk.status = ChunkStatus::Completed;
            chunk.continuation = None;
        }
        chunk.last_error = None;
        chunk.updated_at = Utc::now();
        self.state.update_chunk(&chunk).await?;

        info!(
            tenant_id = %chunk.tenant_id,
            table = %chunk.table_name,
            status = %chunk.status,
            from_offset = start,
            to_offset = current,
            flushed,
            records_total = chunk.records_processed,
            "Chunk invocation finished"
        );

        Ok(ChunkOutcome::from_progress(&chunk))
    }

    async fn mark_failed(&self, chunk: &mut ChunkProgress, error: &IngestError) -> Result<()> {
        chunk.status = ChunkStatus::Failed;
        chunk.last_error = Some(error.to_string());
        chunk.updated_at = Utc::now();
        self.state.update_chunk(chunk).await
    }
}
