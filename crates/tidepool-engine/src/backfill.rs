//! Backfill coordinator
//!
//! Drives historical loads for a newly onboarded tenant through the regular
//! planner, processor and aggregator. Progress lives in a [`BackfillJob`], so
//! an invocation that runs out of time returns `InProgress` and the next one
//! resumes where it stopped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::aggregator::ResultAggregator;
use crate::deadline::Deadline;
use crate::dispatch::{Dispatcher, TransformRequest};
use crate::error::{IngestError, Result};
use crate::planner::{resolve_range, ChunkPlanner};
use crate::processor::ChunkProcessor;
use crate::state::{BackfillJob, BackfillStatus, ChunkStatus, DateWindow, JobError, JobStatus, StateStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub tenant_id: String,
    pub service: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub chunk_size_days: Option<u32>,
    #[serde(default)]
    pub resume_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// Budget ran out; re-invoke with `resume_job_id = job_id`
    InProgress {
        job_id: Uuid,
        processed_tables: Vec<String>,
        pending_tables: Vec<String>,
    },
    Finished { job: BackfillJob },
}

/// Where one table stopped within an invocation
enum TableProgress {
    Done,
    OutOfTime,
}

pub struct BackfillCoordinator {
    state: Arc<dyn StateStore>,
    planner: Arc<ChunkPlanner>,
    processor: Arc<ChunkProcessor>,
    aggregator: Arc<ResultAggregator>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl BackfillCoordinator {
    pub fn new(
        state: Arc<dyn StateStore>,
        planner: Arc<ChunkPlanner>,
        processor: Arc<ChunkProcessor>,
        aggregator: Arc<ResultAggregator>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            state,
            planner,
            processor,
            aggregator,
            dispatcher,
        }
    }

    #[instrument(
        skip(self, request, deadline),
        fields(tenant_id = %request.tenant_id, service = %request.service, resume = ?request.resume_job_id)
    )]
    pub async fn run(&self, request: BackfillRequest, deadline: &Deadline) -> Result<BackfillOutcome> {
        let mut job = match request.resume_job_id {
            Some(job_id) => {
                let job = self.state.get_backfill(job_id).await?.ok_or_else(|| {
                    IngestError::Config(format!("backfill job {} does not exist", job_id))
                })?;
                if job.status.is_terminal() {
                    info!(job_id = %job_id, status = job.status.as_str(), "Backfill already finished");
                    return Ok(BackfillOutcome::Finished { job });
                }
                job
            },
            None => self.create(&request).await?,
        };

        if job.status == BackfillStatus::Pending {
            job.status = BackfillStatus::Running;
            self.save(&mut job).await?;
        }

        let pending: Vec<String> = job
            .tables
            .iter()
            .filter(|t| !job.processed_tables.contains(t))
            .cloned()
            .collect();

        for table in pending {
            match self.run_table(&mut job, &table, deadline).await? {
                TableProgress::Done => {},
                TableProgress::OutOfTime => return Ok(self.in_progress(&job)),
            }
        }

        self.complete(job).await
    }

    async fn create(&self, request: &BackfillRequest) -> Result<BackfillJob> {
        let tables = crate::canonical::dedup(&request.tables);
        let first = tables
            .first()
            .cloned()
            .ok_or_else(|| IngestError::Config("backfill needs at least one table".into()))?;

        let range = resolve_range(
            request.start_date.as_deref(),
            request.end_date.as_deref(),
            Utc::now(),
            self.planner.config().lookback_days,
        )?;
        let chunk_size_days = request
            .chunk_size_days
            .unwrap_or(self.planner.config().chunk_size_days);
        if chunk_size_days == 0 {
            return Err(IngestError::Config("chunk_size_days must be positive".into()));
        }

        let now = Utc::now();
        let job = BackfillJob {
            job_id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            service: request.service.clone(),
            table_name: first,
            tables,
            start_date: range.start,
            end_date: range.end,
            chunk_size_days,
            status: BackfillStatus::Pending,
            processed_tables: Vec::new(),
            table_jobs: Default::default(),
            total_records: 0,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.state.put_backfill(&job).await?;

        info!(
            job_id = %job.job_id,
            tables = job.tables.len(),
            start = %job.start_date,
            end = %job.end_date,
            "Created backfill job"
        );
        Ok(job)
    }

    /// Plan (once), process and finalize one table
    async fn run_table(&self, job: &mut BackfillJob, table: &str, deadline: &Deadline) -> Result<TableProgress> {
        if deadline.is_expired() {
            return Ok(TableProgress::OutOfTime);
        }

        let table_job = match job.table_jobs.get(table) {
            Some(id) => *id,
            None => {
                let range = DateWindow {
                    start: job.start_date,
                    end: job.end_date,
                };
                match self
                    .planner
                    .plan_range(&job.tenant_id, &job.service, table, range, job.chunk_size_days)
                    .await
                {
                    Ok(plan) => {
                        job.table_jobs.insert(table.to_string(), plan.job.job_id);
                        self.save(job).await?;
                        plan.job.job_id
                    },
                    Err(e) if !e.is_retryable() => {
                        warn!(table, error = %e, "Could not plan table, skipping it");
                        job.errors.push(JobError::table(table, e.to_string()));
                        job.processed_tables.push(table.to_string());
                        self.save(job).await?;
                        return Ok(TableProgress::Done);
                    },
                    Err(e) => return Err(e),
                }
            },
        };

        let mut chunks = self.state.list_chunks(table_job).await?;
        chunks.sort_by_key(|c| c.chunk_id);

        for chunk in chunks.iter().filter(|c| !c.status.is_finished()) {
            // A continuation is re-invoked for as long as time remains
            loop {
                if deadline.is_expired() {
                    debug!(table, chunk_id = chunk.chunk_id, "Deadline reached, pausing backfill");
                    return Ok(TableProgress::OutOfTime);
                }

                match self.processor.process(table_job, chunk.chunk_id, deadline).await {
                    Ok(outcome) if outcome.status == ChunkStatus::TimeoutContinuation => continue,
                    Ok(_) => break,
                    Err(e) => {
                        // Credential failures mark the chunk failed before surfacing
                        let finished = self
                            .state
                            .get_chunk(table_job, chunk.chunk_id)
                            .await?
                            .is_some_and(|c| c.status.is_finished());
                        if !finished {
                            return Err(e);
                        }
                        warn!(table, chunk_id = chunk.chunk_id, error = %e, "Chunk failed");
                        break;
                    },
                }
            }
        }

        let aggregate = self.aggregator.aggregate_job(table_job, Vec::new(), false).await?;
        job.total_records += aggregate.total_records;
        job.errors.extend(aggregate.errors);
        job.processed_tables.push(table.to_string());
        self.save(job).await?;

        info!(
            table,
            status = %aggregate.status,
            records = aggregate.total_records,
            "Backfilled table"
        );
        Ok(TableProgress::Done)
    }

    async fn complete(&self, mut job: BackfillJob) -> Result<BackfillOutcome> {
        // Historical data is older than the transform watermark, so force it
        for table in job.tables.iter().filter(|t| job.table_jobs.contains_key(*t)) {
            self.dispatcher
                .dispatch_transform(TransformRequest {
                    tenant_id: job.tenant_id.clone(),
                    service: job.service.clone(),
                    table_name: table.clone(),
                    files: None,
                    force_reprocess: true,
                })
                .await?;
        }

        let mut table_statuses = Vec::with_capacity(job.table_jobs.len());
        for table_job in job.table_jobs.values() {
            if let Some(stored) = self.state.get_job(*table_job).await? {
                table_statuses.push(stored.status);
            }
        }
        job.status = terminal_status(&job.errors, table_statuses);
        job.completed_at = Some(Utc::now());
        self.save(&mut job).await?;

        info!(
            job_id = %job.job_id,
            status = job.status.as_str(),
            total_records = job.total_records,
            errors = job.errors.len(),
            "Backfill finished"
        );
        Ok(BackfillOutcome::Finished { job })
    }

    fn in_progress(&self, job: &BackfillJob) -> BackfillOutcome {
        let pending_tables = job
            .tables
            .iter()
            .filter(|t| !job.processed_tables.contains(t))
            .cloned()
            .collect();
        info!(job_id = %job.job_id, "Backfill paused, resume to continue");
        BackfillOutcome::InProgress {
            job_id: job.job_id,
            processed_tables: job.processed_tables.clone(),
            pending_tables,
        }
    }

    async fn save(&self, job: &mut BackfillJob) -> Result<()> {
        job.updated_at = Utc::now();
        self.state.put_backfill(job).await
    }
}

/// Settle a backfill on the worst outcome among its tables
fn terminal_status(errors: &[JobError], table_statuses: impl IntoIterator<Item = JobStatus>) -> BackfillStatus {
    let initial = if errors.is_empty() {
        JobStatus::Completed
    } else {
        JobStatus::CompletedWithErrors
    };
    match table_statuses.into_iter().fold(initial, JobStatus::worst) {
        JobStatus::CompletedWithErrors | JobStatus::Failed => BackfillStatus::CompletedWithErrors,
        _ => BackfillStatus::Completed,
    }
}
