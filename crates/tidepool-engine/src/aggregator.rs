//! Result aggregation
//!
//! Rolls chunk outcomes up into one job status and hands the exact raw file
//! lists to the canonical transformer, grouped by (tenant, service, table).
//! Chunk completion order is irrelevant; nothing here assumes it matches
//! chunk id order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::canonical::dedup;
use crate::dispatch::{Dispatcher, TransformRequest};
use crate::error::{IngestError, Result};
use crate::metrics::{emit_observational, Metric, MetricsSink};
use crate::processor::ChunkOutcome;
use crate::state::{ChunkStatus, JobError, JobStatus, StateStore};

pub const UNFINISHED_CHUNK_MESSAGE: &str = "chunk did not finish before aggregation";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_records: u64,
    pub chunks_succeeded: usize,
    pub chunks_failed: usize,
    pub errors: Vec<JobError>,
    /// False when the job had already been finalized by an earlier call
    pub finalized: bool,
    pub transforms: Vec<TransformRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackOutcome {
    pub job_id: Uuid,
    pub chunk_id: u32,
    pub transform: Option<TransformRequest>,
}

/// Raw files grouped per (tenant, service, table), groups in first-seen order
pub fn group_files(outcomes: &[ChunkOutcome]) -> Vec<TransformRequest> {
    let mut index: HashMap<(&str, &str, &str), usize> = HashMap::new();
    let mut groups: Vec<(&ChunkOutcome, Vec<String>)> = Vec::new();

    for outcome in outcomes {
        let key = (
            outcome.tenant_id.as_str(),
            outcome.service.as_str(),
            outcome.table_name.as_str(),
        );
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((outcome, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.extend(outcome.files.iter().cloned());
    }

    groups
        .into_iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(first, files)| TransformRequest {
            tenant_id: first.tenant_id.clone(),
            service: first.service.clone(),
            table_name: first.table_name.clone(),
            files: Some(dedup(&files)),
            force_reprocess: false,
        })
        .collect()
}

pub struct ResultAggregator {
    state: Arc<dyn StateStore>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResultAggregator {
    pub fn new(
        state: Arc<dyn StateStore>,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            state,
            dispatcher,
            metrics,
        }
    }

    /// Finalize a job from its chunk outcomes.
    ///
    /// With no outcomes given, the job's persisted chunk records are used.
    #[instrument(skip(self, outcomes), fields(outcomes = outcomes.len()))]
    pub async fn aggregate_job(
        &self,
        job_id: Uuid,
        outcomes: Vec<ChunkOutcome>,
        forward_files: bool,
    ) -> Result<AggregateOutcome> {
        let job = self
            .state
            .get_job(job_id)
            .await?
            .ok_or_else(|| IngestError::Config(format!("job {} does not exist", job_id)))?;

        if job.status.is_terminal() {
            debug!(status = %job.status, "Job already finalized");
            return Ok(AggregateOutcome {
                job_id,
                status: job.status,
                total_records: job.total_records,
                chunks_succeeded: 0,
                chunks_failed: 0,
                errors: job.errors,
                finalized: false,
                transforms: Vec::new(),
            });
        }

        let outcomes = if outcomes.is_empty() {
            self.state
                .list_chunks(job_id)
                .await?
                .iter()
                .map(ChunkOutcome::from_progress)
                .collect()
        } else {
            outcomes
        };

        let mut succeeded = 0;
        let mut errors = Vec::new();
        for outcome in &outcomes {
            match outcome.status {
                ChunkStatus::Completed => succeeded += 1,
                ChunkStatus::Failed => errors.push(JobError::chunk(
                    outcome.chunk_id,
                    &outcome.table_name,
                    outcome.error.clone().unwrap_or_else(|| "chunk failed".to_string()),
                )),
                ChunkStatus::TimeoutContinuation | ChunkStatus::Processing => errors.push(
                    JobError::chunk(outcome.chunk_id, &outcome.table_name, UNFINISHED_CHUNK_MESSAGE),
                ),
            }
        }

        let status = JobStatus::from_counts(succeeded, errors.len());
        let total_records: u64 = outcomes.iter().map(|o| o.records_fetched).sum();

        // Only the call that wins finalization hands files on
        if !self.state.finalize_job(job_id, status, total_records, &errors).await? {
            warn!("Job was finalized concurrently, leaving dispatch to the winner");
            let stored = self.state.get_job(job_id).await?.unwrap_or(job);
            return Ok(AggregateOutcome {
                job_id,
                status: stored.status,
                total_records: stored.total_records,
                chunks_succeeded: 0,
                chunks_failed: 0,
                errors: stored.errors,
                finalized: false,
                transforms: Vec::new(),
            });
        }

        let transforms = if forward_files {
            group_files(&outcomes)
        } else {
            Vec::new()
        };
        for request in &transforms {
            self.dispatcher.dispatch_transform(request.clone()).await?;
        }

        emit_observational(
            self.metrics.as_ref(),
            vec![
                Metric::new("chunks_succeeded", succeeded as f64)
                    .with("tenant_id", job.tenant_id.as_str())
                    .with("table", job.table_name.as_str()),
                Metric::new("chunks_failed", errors.len() as f64)
                    .with("tenant_id", job.tenant_id.as_str())
                    .with("table", job.table_name.as_str()),
                Metric::new("records_fetched", total_records as f64)
                    .with("tenant_id", job.tenant_id.as_str())
                    .with("table", job.table_name.as_str())
                    .with("status", status.as_str()),
            ],
        )
        .await;

        info!(
            tenant_id = %job.tenant_id,
            table = %job.table_name,
            status = %status,
            succeeded,
            failed = errors.len(),
            total_records,
            transforms = transforms.len(),
            "Job aggregated"
        );

        Ok(AggregateOutcome {
            job_id,
            status,
            total_records,
            chunks_succeeded: succeeded,
            chunks_failed: errors.len(),
            errors,
            finalized: true,
            transforms,
        })
    }

    /// Forward one finished chunk's files without waiting for the rest of the job
    #[instrument(skip(self, outcome), fields(job_id = %outcome.job_id, chunk_id = outcome.chunk_id))]
    pub async fn chunk_callback(&self, outcome: ChunkOutcome) -> Result<CallbackOutcome> {
        let mut result = CallbackOutcome {
            job_id: outcome.job_id,
            chunk_id: outcome.chunk_id,
            transform: None,
        };

        if !outcome.status.is_finished() {
            debug!(status = %outcome.status, "Chunk still running, nothing to forward");
            return Ok(result);
        }

        let request = group_files(std::slice::from_ref(&outcome)).into_iter().next();
        if let Some(request) = request {
            self.dispatcher.dispatch_transform(request.clone()).await?;
            result.transform = Some(request);
        }

        emit_observational(
            self.metrics.as_ref(),
            vec![Metric::new("chunk_records", outcome.records_fetched as f64)
                .with("tenant_id", outcome.tenant_id.as_str())
                .with("table", outcome.table_name.as_str())
                .with("status", outcome.status.as_str())],
        )
        .await;

        Ok(result)
    }
}
