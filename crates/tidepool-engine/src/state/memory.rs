use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::models::*;
use super::StateStore;
use crate::error::{IngestError, Result};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, ProcessingJob>,
    chunks: BTreeMap<(Uuid, u32), ChunkProgress>,
    merge_watermarks: HashMap<(String, String), DateTime<Utc>>,
    merged_files: HashMap<(String, String, String), DateTime<Utc>>,
    transform_watermarks: HashMap<(String, String, String), DateTime<Utc>>,
    leases: HashMap<(String, String), (String, DateTime<Utc>)>,
    backfills: HashMap<Uuid, BackfillJob>,
    tenant_services: HashMap<(String, String), TenantServiceRecord>,
}

/// State store kept in process memory
#[derive(Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| IngestError::Internal("state store lock poisoned".into()))
    }
}

fn key2(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put_job(&self, job: &ProcessingJob) -> Result<()> {
        self.lock()?.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        total_records: u64,
        errors: &[JobError],
    ) -> Result<bool> {
        let mut tables = self.lock()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| IngestError::State(format!("job {} not found", job_id)))?;

        if job.status.is_terminal() {
            return Ok(false);
        }

        job.status = status;
        job.total_records = total_records;
        job.errors = errors.to_vec();
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn put_chunks(&self, chunks: &[ChunkProgress]) -> Result<()> {
        let mut tables = self.lock()?;
        for chunk in chunks {
            tables.chunks.insert((chunk.job_id, chunk.chunk_id), chunk.clone());
        }
        Ok(())
    }

    async fn get_chunk(&self, job_id: Uuid, chunk_id: u32) -> Result<Option<ChunkProgress>> {
        Ok(self.lock()?.chunks.get(&(job_id, chunk_id)).cloned())
    }

    async fn update_chunk(&self, chunk: &ChunkProgress) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.chunks.get_mut(&(chunk.job_id, chunk.chunk_id)) {
            Some(existing) => {
                *existing = chunk.clone();
                Ok(())
            },
            None => Err(IngestError::State(format!(
                "chunk {}/{} not found",
                chunk.job_id, chunk.chunk_id
            ))),
        }
    }

    async fn list_chunks(&self, job_id: Uuid) -> Result<Vec<ChunkProgress>> {
        Ok(self
            .lock()?
            .chunks
            .range((job_id, 0)..=(job_id, u32::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn get_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock()?.merge_watermarks.get(&key2(tenant_id, canonical_table)).copied())
    }

    async fn set_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        merged_through: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let entry = tables
            .merge_watermarks
            .entry(key2(tenant_id, canonical_table))
            .or_insert(merged_through);
        *entry = (*entry).max(merged_through);
        Ok(())
    }

    async fn get_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = (tenant_id.to_string(), canonical_table.to_string(), file_key.to_string());
        Ok(self.lock()?.merged_files.get(&key).copied())
    }

    async fn record_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        let key = (tenant_id.to_string(), canonical_table.to_string(), file_key.to_string());
        let mut tables = self.lock()?;
        let entry = tables.merged_files.entry(key).or_insert(last_modified);
        *entry = (*entry).max(last_modified);
        Ok(())
    }

    async fn get_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = (tenant_id.to_string(), service.to_string(), table.to_string());
        Ok(self.lock()?.transform_watermarks.get(&key).copied())
    }

    async fn set_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
        transformed_through: DateTime<Utc>,
    ) -> Result<()> {
        let key = (tenant_id.to_string(), service.to_string(), table.to_string());
        let mut tables = self.lock()?;
        let entry = tables.transform_watermarks.entry(key).or_insert(transformed_through);
        *entry = (*entry).max(transformed_through);
        Ok(())
    }

    async fn try_acquire_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| IngestError::Config(format!("lease ttl out of range: {}", e)))?;

        let mut tables = self.lock()?;
        let key = key2(tenant_id, canonical_table);
        let free = match tables.leases.get(&key) {
            None => true,
            Some((holder, until)) => holder == owner || *until <= now,
        };

        if free {
            tables.leases.insert(key, (owner.to_string(), expires_at));
        }
        Ok(free)
    }

    async fn release_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let key = key2(tenant_id, canonical_table);
        if tables.leases.get(&key).map(|(holder, _)| holder == owner).unwrap_or(false) {
            tables.leases.remove(&key);
        }
        Ok(())
    }

    async fn put_backfill(&self, job: &BackfillJob) -> Result<()> {
        self.lock()?.backfills.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_backfill(&self, job_id: Uuid) -> Result<Option<BackfillJob>> {
        Ok(self.lock()?.backfills.get(&job_id).cloned())
    }

    async fn get_tenant_service(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> Result<Option<TenantServiceRecord>> {
        Ok(self.lock()?.tenant_services.get(&key2(tenant_id, service)).cloned())
    }

    async fn put_tenant_service(&self, record: &TenantServiceRecord) -> Result<()> {
        self.lock()?
            .tenant_services
            .insert(key2(&record.tenant_id, &record.service), record.clone());
        Ok(())
    }
}
