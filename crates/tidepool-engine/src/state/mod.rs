//! Metadata/state store
//!
//! All coordination between invocations goes through these records; there is
//! no in-memory state shared across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStateStore;
pub use models::*;
pub use postgres::PgStateStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a processing job
    async fn put_job(&self, job: &ProcessingJob) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>>;

    /// Move a job to a terminal status. Returns false when it already was terminal.
    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        total_records: u64,
        errors: &[JobError],
    ) -> Result<bool>;

    async fn put_chunks(&self, chunks: &[ChunkProgress]) -> Result<()>;

    async fn get_chunk(&self, job_id: Uuid, chunk_id: u32) -> Result<Option<ChunkProgress>>;

    async fn update_chunk(&self, chunk: &ChunkProgress) -> Result<()>;

    /// Chunks of a job ordered by chunk id
    async fn list_chunks(&self, job_id: Uuid) -> Result<Vec<ChunkProgress>>;

    async fn get_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Advance the watermark; never moves it backwards
    async fn set_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        merged_through: DateTime<Utc>,
    ) -> Result<()>;

    /// Modification time a canonical file had when it was last merged
    async fn get_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Record a merged canonical file; a later modification time replaces an earlier one
    async fn record_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn set_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
        transformed_through: DateTime<Utc>,
    ) -> Result<()>;

    /// Take the single-flight merge lease for (tenant, table).
    ///
    /// Succeeds when nobody holds it, the holder's lease expired, or `owner`
    /// already holds it.
    async fn try_acquire_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
    ) -> Result<()>;

    async fn put_backfill(&self, job: &BackfillJob) -> Result<()>;

    async fn get_backfill(&self, job_id: Uuid) -> Result<Option<BackfillJob>>;

    async fn get_tenant_service(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> Result<Option<TenantServiceRecord>>;

    async fn put_tenant_service(&self, record: &TenantServiceRecord) -> Result<()>;
}
