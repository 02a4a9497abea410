//! Durable job, chunk and backfill records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::IngestError;

/// Processing job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Ranking used when combining outcomes: failed > completed_with_errors > completed
    pub fn severity(&self) -> u8 {
        match self {
            JobStatus::Pending | JobStatus::Running => 0,
            JobStatus::Completed => 1,
            JobStatus::CompletedWithErrors => 2,
            JobStatus::Failed => 3,
        }
    }

    /// The more severe of two statuses
    pub fn worst(a: JobStatus, b: JobStatus) -> JobStatus {
        if b.severity() > a.severity() {
            b
        } else {
            a
        }
    }

    /// Roll chunk counts up into a job status
    pub fn from_counts(succeeded: usize, failed: usize) -> JobStatus {
        match (succeeded, failed) {
            (0, f) if f > 0 => JobStatus::Failed,
            (_, f) if f > 0 => JobStatus::CompletedWithErrors,
            _ => JobStatus::Completed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            other => Err(IngestError::State(format!("unknown job status '{}'", other))),
        }
    }
}

/// One entry of a job's error list, enough to retry the failed unit alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
}

impl JobError {
    pub fn chunk(chunk_id: u32, table: &str, message: impl Into<String>) -> Self {
        Self {
            chunk_id: Some(chunk_id),
            table: Some(table.to_string()),
            file: None,
            message: message.into(),
        }
    }

    pub fn table(table: &str, message: impl Into<String>) -> Self {
        Self {
            chunk_id: None,
            table: Some(table.to_string()),
            file: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: u64,
    pub errors: Vec<JobError>,
}

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Processing,
    Completed,
    TimeoutContinuation,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::TimeoutContinuation => "timeout_continuation",
            ChunkStatus::Failed => "failed",
        }
    }

    /// Completed or failed; nothing further will run without an explicit retry
    pub fn is_finished(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ChunkStatus::Processing),
            "completed" => Ok(ChunkStatus::Completed),
            "timeout_continuation" => Ok(ChunkStatus::TimeoutContinuation),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(IngestError::State(format!("unknown chunk status '{}'", other))),
        }
    }
}

/// Where an interrupted chunk picks up again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationState {
    pub current_offset: u64,
    pub remaining_records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub job_id: Uuid,
    pub chunk_id: u32,
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    pub window: Option<DateWindow>,
    pub start_offset: u64,
    pub end_offset: u64,
    /// `end_offset` is a cap, not a count; the source may hold more records
    #[serde(default)]
    pub open_ended: bool,
    pub estimated_records: u64,
    pub records_processed: u64,
    pub status: ChunkStatus,
    pub continuation: Option<ContinuationState>,
    pub output_files: Vec<String>,
    pub invocations: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkProgress {
    /// Offset the next invocation starts from
    pub fn resume_offset(&self) -> u64 {
        self.continuation
            .map(|c| c.current_offset)
            .unwrap_or(self.start_offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "PENDING",
            BackfillStatus::Running => "RUNNING",
            BackfillStatus::Completed => "COMPLETED",
            BackfillStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::CompletedWithErrors)
    }
}

impl FromStr for BackfillStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BackfillStatus::Pending),
            "RUNNING" => Ok(BackfillStatus::Running),
            "COMPLETED" => Ok(BackfillStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(BackfillStatus::CompletedWithErrors),
            other => Err(IngestError::State(format!("unknown backfill status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub service: String,
    /// First requested table, kept for display
    pub table_name: String,
    pub tables: Vec<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub chunk_size_days: u32,
    pub status: BackfillStatus,
    pub processed_tables: Vec<String>,
    /// table -> processing job driving its chunks
    pub table_jobs: BTreeMap<String, Uuid>,
    pub total_records: u64,
    pub errors: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which secret and endpoints a tenant has configured for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantServiceRecord {
    pub tenant_id: String,
    pub service: String,
    pub secret_ref: String,
    pub enabled_endpoints: Vec<String>,
    pub source_system: String,
}
