//! Tidepool CLI Library
//!
//! Task entry points for the workflow orchestrator. Each subcommand runs one
//! bounded unit of pipeline work and prints its outcome as JSON on stdout:
//!
//! - **Planning**: split a table load into chunks (`tidepool plan`)
//! - **Chunks**: process one chunk until done or out of time (`tidepool process-chunk`)
//! - **Aggregation**: roll a job up and forward raw files (`tidepool aggregate`, `tidepool chunk-callback`)
//! - **Canonical stage**: raw files to canonical Parquet (`tidepool transform`)
//! - **Merge**: canonical files into the analytical store (`tidepool merge`)
//! - **Backfill**: historical loads, resumable (`tidepool backfill`)
//! - **Dispatch**: run a queued request from the outbox (`tidepool run-request`)

pub mod commands;
pub mod error;

pub use error::{CliError, Result};

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tidepool_engine::mapping::ScdType;
use uuid::Uuid;

/// Tidepool - multi-tenant SaaS ingestion
#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Wall-clock budget of this invocation in seconds
    #[arg(long, env = "TIDEPOOL_BUDGET_SECS", global = true)]
    pub budget_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScdArg {
    #[value(name = "type_1", alias = "1")]
    Type1,
    #[value(name = "type_2", alias = "2")]
    Type2,
}

impl From<ScdArg> for ScdType {
    fn from(arg: ScdArg) -> Self {
        match arg {
            ScdArg::Type1 => ScdType::Type1,
            ScdArg::Type2 => ScdType::Type2,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan the chunks of one table load
    Plan {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        service: String,

        #[arg(long)]
        table: String,

        /// YYYY-MM-DD or RFC 3339 (defaults to the lookback window)
        #[arg(long)]
        start_date: Option<String>,

        /// YYYY-MM-DD or RFC 3339 (defaults to the start of today, UTC)
        #[arg(long)]
        end_date: Option<String>,

        #[arg(long)]
        chunk_size_days: Option<u32>,
    },

    /// Process one chunk, returning a continuation if time runs out
    ProcessChunk {
        #[arg(long)]
        job_id: Uuid,

        #[arg(long)]
        chunk_id: u32,
    },

    /// Finalize a job from its chunk outcomes
    Aggregate {
        #[arg(long)]
        job_id: Uuid,

        /// JSON array of chunk outcomes (defaults to the stored chunk records)
        #[arg(long)]
        outcomes: Option<PathBuf>,

        /// Do not dispatch transforms for the job's raw files
        #[arg(long)]
        no_forward: bool,
    },

    /// Forward one finished chunk's raw files
    ChunkCallback {
        /// JSON chunk outcome
        #[arg(long)]
        outcome: PathBuf,
    },

    /// Transform raw files into canonical Parquet files
    Transform {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        service: String,

        #[arg(long)]
        table: String,

        /// Raw file keys; new files are discovered when none are given
        #[arg(long = "file")]
        files: Vec<String>,

        /// Reprocess files older than the transform watermark
        #[arg(long)]
        force: bool,
    },

    /// Merge canonical files into the analytical store
    Merge {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        table: String,

        /// Canonical file keys
        #[arg(long = "file", required = true)]
        files: Vec<String>,

        /// Inferred from the files when omitted
        #[arg(long, value_enum)]
        scd_type: Option<ScdArg>,
    },

    /// Backfill historical data for a tenant
    Backfill {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        service: String,

        /// Tables to backfill (required unless resuming)
        #[arg(long = "table")]
        tables: Vec<String>,

        #[arg(long)]
        start_date: Option<String>,

        #[arg(long)]
        end_date: Option<String>,

        #[arg(long)]
        chunk_size_days: Option<u32>,

        /// Continue an earlier backfill
        #[arg(long)]
        resume_job_id: Option<Uuid>,
    },

    /// Run a dispatched transform or merge request file
    RunRequest {
        path: PathBuf,
    },

    /// Apply state store migrations
    Migrate,
}
