//! `tidepool aggregate` and `tidepool chunk-callback` command implementations

use std::path::Path;
use tidepool_engine::processor::ChunkOutcome;
use uuid::Uuid;

use super::{print_json, read_json, Services};
use crate::error::Result;

/// Finalize a job, from the given outcomes file or from stored chunk records
pub async fn run(services: &Services, job_id: Uuid, outcomes: Option<&Path>, forward_files: bool) -> Result<()> {
    let outcomes: Vec<ChunkOutcome> = match outcomes {
        Some(path) => read_json(path).await?,
        None => Vec::new(),
    };
    let aggregate = services.aggregator.aggregate_job(job_id, outcomes, forward_files).await?;
    print_json(&aggregate)
}

/// Forward one chunk's raw files as soon as it finishes
pub async fn callback(services: &Services, outcome: &Path) -> Result<()> {
    let outcome: ChunkOutcome = read_json(outcome).await?;
    let result = services.aggregator.chunk_callback(outcome).await?;
    print_json(&result)
}
