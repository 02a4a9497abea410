//! `tidepool plan` command implementation

use tidepool_engine::planner::PlanRequest;
use tracing::info;

use super::{print_json, Services};
use crate::error::Result;

/// Plan the chunks of one table load and persist the job
pub async fn run(services: &Services, request: PlanRequest) -> Result<()> {
    let plan = services.planner.plan(&request).await?;
    info!(job_id = %plan.job.job_id, chunks = plan.chunks.len(), "Planned");
    print_json(&plan)
}
