//! Tidepool CLI - Main entry point

use clap::Parser;
use std::process;
use tidepool_cli::commands::{self, Services};
use tidepool_cli::{Cli, CliError, Commands};
use tidepool_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tidepool_engine::backfill::BackfillRequest;
use tidepool_engine::config::EngineConfig;
use tidepool_engine::dispatch::{MergeRequest, TransformRequest};
use tidepool_engine::planner::PlanRequest;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON outcome
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("tidepool")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = execute_command(cli).await {
        error!(error = %e, retryable = e.is_retryable(), "Command failed");
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

async fn execute_command(cli: Cli) -> Result<(), CliError> {
    let config = EngineConfig::load()?;

    if let Commands::Migrate = cli.command {
        return commands::migrate::run(&config).await;
    }

    let services = Services::connect(config).await?;
    let budget = cli.budget_secs;

    match cli.command {
        Commands::Plan {
            tenant_id,
            service,
            table,
            start_date,
            end_date,
            chunk_size_days,
        } => {
            let request = PlanRequest {
                tenant_id,
                service,
                table_name: table,
                start_date,
                end_date,
                chunk_size_days,
            };
            commands::plan::run(&services, request).await
        },

        Commands::ProcessChunk { job_id, chunk_id } => {
            commands::process::run(&services, job_id, chunk_id, budget).await
        },

        Commands::Aggregate {
            job_id,
            outcomes,
            no_forward,
        } => commands::aggregate::run(&services, job_id, outcomes.as_deref(), !no_forward).await,

        Commands::ChunkCallback { outcome } => commands::aggregate::callback(&services, &outcome).await,

        Commands::Transform {
            tenant_id,
            service,
            table,
            files,
            force,
        } => {
            let request = TransformRequest {
                tenant_id,
                service,
                table_name: table,
                files: (!files.is_empty()).then_some(files),
                force_reprocess: force,
            };
            commands::transform::run(&services, request).await
        },

        Commands::Merge {
            tenant_id,
            table,
            files,
            scd_type,
        } => {
            let request = MergeRequest {
                tenant_id,
                canonical_table: table,
                files,
                scd_type: scd_type.map(Into::into),
            };
            commands::merge::run(&services, request).await
        },

        Commands::Backfill {
            tenant_id,
            service,
            tables,
            start_date,
            end_date,
            chunk_size_days,
            resume_job_id,
        } => {
            let request = BackfillRequest {
                tenant_id,
                service,
                tables,
                start_date,
                end_date,
                chunk_size_days,
                resume_job_id,
            };
            commands::backfill::run(&services, request, budget).await
        },

        Commands::RunRequest { path } => commands::request::run(&services, &path).await,

        Commands::Migrate => commands::migrate::run(&services.config).await,
    }
}
