//! `tidepool process-chunk` command implementation

use uuid::Uuid;

use super::{print_json, Services};
use crate::error::Result;

/// Process one chunk within this invocation's budget
pub async fn run(services: &Services, job_id: Uuid, chunk_id: u32, budget_secs: Option<u64>) -> Result<()> {
    let deadline = services.deadline(budget_secs);
    let outcome = services.processor.process(job_id, chunk_id, &deadline).await?;
    print_json(&outcome)
}
