//! `tidepool merge` command implementation

use tidepool_engine::dispatch::MergeRequest;
use tidepool_engine::merge::MergeOutcome;
use tidepool_engine::IngestError;

use super::{print_json, Services};
use crate::error::Result;

pub async fn run(services: &Services, request: MergeRequest) -> Result<()> {
    let outcome = services.merger.merge(request).await?;
    print_json(&outcome)?;
    ensure_merged(&outcome)
}

/// A busy merge did no work, so the task fails as retryable and the
/// orchestrator runs it again once the lease is free.
pub fn ensure_merged(outcome: &MergeOutcome) -> Result<()> {
    match outcome {
        MergeOutcome::Busy {
            tenant_id,
            canonical_table,
        } => Err(IngestError::Transient(format!(
            "another merge of {}/{} holds the lease",
            tenant_id, canonical_table
        ))
        .into()),
        MergeOutcome::Completed { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_merge_fails_as_retryable() {
        let busy = MergeOutcome::Busy {
            tenant_id: "acme".into(),
            canonical_table: "companies".into(),
        };
        let err = ensure_merged(&busy).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("acme/companies"));
    }

    #[test]
    fn test_completed_merge_succeeds() {
        let done = MergeOutcome::Completed {
            tenant_id: "acme".into(),
            canonical_table: "companies".into(),
            files_processed: 1,
            files_failed: 0,
            files_skipped: 0,
            rows_staged: 3,
            errors: Vec::new(),
        };
        assert!(ensure_merged(&done).is_ok());
    }
}
