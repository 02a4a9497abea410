//! Postgres-backed state store (schema in `migrations/`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::StateStore;
use crate::config::DatabaseConfig;
use crate::error::{IngestError, Result};

#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        info!("Connected to state store");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("State store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| IngestError::State(format!("{} out of range: {}", field, value)))
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

#[derive(FromRow)]
struct JobRow {
    job_id: Uuid,
    tenant_id: String,
    service: String,
    table_name: String,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    total_records: i64,
    errors: Json<Vec<JobError>>,
}

impl TryFrom<JobRow> for ProcessingJob {
    type Error = IngestError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(ProcessingJob {
            job_id: row.job_id,
            tenant_id: row.tenant_id,
            service: row.service,
            table_name: row.table_name,
            status: row.status.parse()?,
            created_at: row.created_at,
            completed_at: row.completed_at,
            total_records: to_u64(row.total_records),
            errors: row.errors.0,
        })
    }
}

#[derive(FromRow)]
struct ChunkRow {
    job_id: Uuid,
    chunk_id: i32,
    tenant_id: String,
    service: String,
    table_name: String,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    start_offset: i64,
    end_offset: i64,
    open_ended: bool,
    estimated_records: i64,
    records_processed: i64,
    status: String,
    continuation: Option<Json<ContinuationState>>,
    output_files: Json<Vec<String>>,
    invocations: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChunkRow> for ChunkProgress {
    type Error = IngestError;

    fn try_from(row: ChunkRow) -> Result<Self> {
        let window = match (row.window_start, row.window_end) {
            (Some(start), Some(end)) => Some(DateWindow { start, end }),
            _ => None,
        };

        Ok(ChunkProgress {
            job_id: row.job_id,
            chunk_id: row.chunk_id.max(0) as u32,
            tenant_id: row.tenant_id,
            service: row.service,
            table_name: row.table_name,
            window,
            start_offset: to_u64(row.start_offset),
            end_offset: to_u64(row.end_offset),
            open_ended: row.open_ended,
            estimated_records: to_u64(row.estimated_records),
            records_processed: to_u64(row.records_processed),
            status: row.status.parse()?,
            continuation: row.continuation.map(|c| c.0),
            output_files: row.output_files.0,
            invocations: row.invocations.max(0) as u32,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct BackfillRow {
    job_id: Uuid,
    tenant_id: String,
    service: String,
    table_name: String,
    tables: Json<Vec<String>>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    chunk_size_days: i32,
    status: String,
    processed_tables: Json<Vec<String>>,
    table_jobs: Json<BTreeMap<String, Uuid>>,
    total_records: i64,
    errors: Json<Vec<JobError>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BackfillRow> for BackfillJob {
    type Error = IngestError;

    fn try_from(row: BackfillRow) -> Result<Self> {
        Ok(BackfillJob {
            job_id: row.job_id,
            tenant_id: row.tenant_id,
            service: row.service,
            table_name: row.table_name,
            tables: row.tables.0,
            start_date: row.start_date,
            end_date: row.end_date,
            chunk_size_days: row.chunk_size_days.max(0) as u32,
            status: row.status.parse()?,
            processed_tables: row.processed_tables.0,
            table_jobs: row.table_jobs.0,
            total_records: to_u64(row.total_records),
            errors: row.errors.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct TenantServiceRow {
    tenant_id: String,
    service: String,
    secret_ref: String,
    enabled_endpoints: Json<Vec<String>>,
    source_system: String,
}

const CHUNK_COLUMNS: &str = "job_id, chunk_id, tenant_id, service, table_name, window_start, \
    window_end, start_offset, end_offset, open_ended, estimated_records, records_processed, \
    status, continuation, output_files, invocations, last_error, updated_at";

#[async_trait]
impl StateStore for PgStateStore {
    async fn put_job(&self, job: &ProcessingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_jobs (
                job_id, tenant_id, service, table_name, status,
                created_at, completed_at, total_records, errors
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                total_records = EXCLUDED.total_records,
                errors = EXCLUDED.errors
            "#,
        )
        .bind(job.job_id)
        .bind(&job.tenant_id)
        .bind(&job.service)
        .bind(&job.table_name)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.completed_at)
        .bind(to_i64(job.total_records, "total_records")?)
        .bind(Json(&job.errors))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.job_id, status = %job.status, "Stored processing job");
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT job_id, tenant_id, service, table_name, status,
                   created_at, completed_at, total_records, errors
            FROM processing_jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessingJob::try_from).transpose()
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        total_records: u64,
        errors: &[JobError],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = $2, total_records = $3, errors = $4, completed_at = NOW()
            WHERE job_id = $1
              AND status NOT IN ('completed', 'completed_with_errors', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(to_i64(total_records, "total_records")?)
        .bind(Json(errors))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn put_chunks(&self, chunks: &[ChunkProgress]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO chunk_progress ({}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
                 ON CONFLICT (job_id, chunk_id) DO NOTHING",
                CHUNK_COLUMNS
            ))
            .bind(chunk.job_id)
            .bind(chunk.chunk_id as i32)
            .bind(&chunk.tenant_id)
            .bind(&chunk.service)
            .bind(&chunk.table_name)
            .bind(chunk.window.map(|w| w.start))
            .bind(chunk.window.map(|w| w.end))
            .bind(to_i64(chunk.start_offset, "start_offset")?)
            .bind(to_i64(chunk.end_offset, "end_offset")?)
            .bind(chunk.open_ended)
            .bind(to_i64(chunk.estimated_records, "estimated_records")?)
            .bind(to_i64(chunk.records_processed, "records_processed")?)
            .bind(chunk.status.as_str())
            .bind(chunk.continuation.map(Json))
            .bind(Json(&chunk.output_files))
            .bind(chunk.invocations as i32)
            .bind(&chunk.last_error)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = chunks.len(), "Stored chunk records");
        Ok(())
    }

    async fn get_chunk(&self, job_id: Uuid, chunk_id: u32) -> Result<Option<ChunkProgress>> {
        let row: Option<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chunk_progress WHERE job_id = $1 AND chunk_id = $2",
            CHUNK_COLUMNS
        ))
        .bind(job_id)
        .bind(chunk_id as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChunkProgress::try_from).transpose()
    }

    async fn update_chunk(&self, chunk: &ChunkProgress) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_progress
            SET records_processed = $3,
                status = $4,
                continuation = $5,
                output_files = $6,
                invocations = $7,
                last_error = $8,
                updated_at = $9,
                end_offset = $10
            WHERE job_id = $1 AND chunk_id = $2
            "#,
        )
        .bind(chunk.job_id)
        .bind(chunk.chunk_id as i32)
        .bind(to_i64(chunk.records_processed, "records_processed")?)
        .bind(chunk.status.as_str())
        .bind(chunk.continuation.map(Json))
        .bind(Json(&chunk.output_files))
        .bind(chunk.invocations as i32)
        .bind(&chunk.last_error)
        .bind(chunk.updated_at)
        .bind(to_i64(chunk.end_offset, "end_offset")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::State(format!(
                "chunk {}/{} not found",
                chunk.job_id, chunk.chunk_id
            )));
        }
        Ok(())
    }

    async fn list_chunks(&self, job_id: Uuid) -> Result<Vec<ChunkProgress>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chunk_progress WHERE job_id = $1 ORDER BY chunk_id",
            CHUNK_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChunkProgress::try_from).collect()
    }

    async fn get_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT merged_through FROM merge_watermarks WHERE tenant_id = $1 AND canonical_table = $2",
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts,)| ts))
    }

    async fn set_merge_watermark(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        merged_through: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO merge_watermarks (tenant_id, canonical_table, merged_through)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, canonical_table) DO UPDATE SET
                merged_through = GREATEST(merge_watermarks.merged_through, EXCLUDED.merged_through),
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .bind(merged_through)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT last_modified FROM merged_files
            WHERE tenant_id = $1 AND canonical_table = $2 AND file_key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .bind(file_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts,)| ts))
    }

    async fn record_merged_file(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        file_key: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO merged_files (tenant_id, canonical_table, file_key, last_modified)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, canonical_table, file_key) DO UPDATE SET
                last_modified = GREATEST(merged_files.last_modified, EXCLUDED.last_modified),
                merged_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .bind(file_key)
        .bind(last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT transformed_through FROM transform_watermarks
            WHERE tenant_id = $1 AND service = $2 AND table_name = $3
            "#,
        )
        .bind(tenant_id)
        .bind(service)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts,)| ts))
    }

    async fn set_transform_watermark(
        &self,
        tenant_id: &str,
        service: &str,
        table: &str,
        transformed_through: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transform_watermarks (tenant_id, service, table_name, transformed_through)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, service, table_name) DO UPDATE SET
                transformed_through = GREATEST(
                    transform_watermarks.transformed_through,
                    EXCLUDED.transformed_through
                ),
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(service)
        .bind(table)
        .bind(transformed_through)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_acquire_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO merge_leases (tenant_id, canonical_table, owner, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (tenant_id, canonical_table) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE merge_leases.expires_at <= NOW() OR merge_leases.owner = EXCLUDED.owner
            RETURNING owner
            "#,
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn release_merge_lease(
        &self,
        tenant_id: &str,
        canonical_table: &str,
        owner: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM merge_leases WHERE tenant_id = $1 AND canonical_table = $2 AND owner = $3",
        )
        .bind(tenant_id)
        .bind(canonical_table)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn put_backfill(&self, job: &BackfillJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_jobs (
                job_id, tenant_id, service, table_name, tables, start_date, end_date,
                chunk_size_days, status, processed_tables, table_jobs, total_records,
                errors, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                processed_tables = EXCLUDED.processed_tables,
                table_jobs = EXCLUDED.table_jobs,
                total_records = EXCLUDED.total_records,
                errors = EXCLUDED.errors,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(job.job_id)
        .bind(&job.tenant_id)
        .bind(&job.service)
        .bind(&job.table_name)
        .bind(Json(&job.tables))
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(job.chunk_size_days as i32)
        .bind(job.status.as_str())
        .bind(Json(&job.processed_tables))
        .bind(Json(&job.table_jobs))
        .bind(to_i64(job.total_records, "total_records")?)
        .bind(Json(&job.errors))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.job_id, status = job.status.as_str(), "Stored backfill job");
        Ok(())
    }

    async fn get_backfill(&self, job_id: Uuid) -> Result<Option<BackfillJob>> {
        let row: Option<BackfillRow> = sqlx::query_as(
            r#"
            SELECT job_id, tenant_id, service, table_name, tables, start_date, end_date,
                   chunk_size_days, status, processed_tables, table_jobs, total_records,
                   errors, created_at, updated_at, completed_at
            FROM backfill_jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackfillJob::try_from).transpose()
    }

    async fn get_tenant_service(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> Result<Option<TenantServiceRecord>> {
        let row: Option<TenantServiceRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, service, secret_ref, enabled_endpoints, source_system
            FROM tenant_services
            WHERE tenant_id = $1 AND service = $2
            "#,
        )
        .bind(tenant_id)
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TenantServiceRecord {
            tenant_id: r.tenant_id,
            service: r.service,
            secret_ref: r.secret_ref,
            enabled_endpoints: r.enabled_endpoints.0,
            source_system: r.source_system,
        }))
    }

    async fn put_tenant_service(&self, record: &TenantServiceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_services (tenant_id, service, secret_ref, enabled_endpoints, source_system)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, service) DO UPDATE SET
                secret_ref = EXCLUDED.secret_ref,
                enabled_endpoints = EXCLUDED.enabled_endpoints,
                source_system = EXCLUDED.source_system
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.service)
        .bind(&record.secret_ref)
        .bind(Json(&record.enabled_endpoints))
        .bind(&record.source_system)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
