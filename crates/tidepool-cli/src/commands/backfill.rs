//! `tidepool backfill` command implementation
//!
//! Prints `in_progress` with the job id when the budget runs out; the
//! orchestrator re-invokes with `--resume-job-id`.

use tidepool_engine::backfill::BackfillRequest;

use super::{print_json, Services};
use crate::error::{CliError, Result};

pub async fn run(services: &Services, request: BackfillRequest, budget_secs: Option<u64>) -> Result<()> {
    if request.resume_job_id.is_none() && request.tables.is_empty() {
        return Err(CliError::InvalidArgument(
            "at least one --table is required for a new backfill".into(),
        ));
    }

    let deadline = services.deadline(budget_secs);
    let outcome = services.backfill.run(request, &deadline).await?;
    print_json(&outcome)
}
