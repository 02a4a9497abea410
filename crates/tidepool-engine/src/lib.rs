//! Tidepool Engine
//!
//! Resumable, checkpointed ingestion of per-tenant SaaS data into a shared
//! multi-tenant analytical store.
//!
//! # Overview
//!
//! The pipeline runs as independently scheduled, bounded invocations that
//! coordinate only through durable job and chunk records:
//!
//! - **Planner**: classifies a table as master or transactional data and plans chunks
//! - **Processor**: fetches one chunk page by page, stopping cleanly at a deadline
//! - **Aggregator**: rolls chunk outcomes into a job status and hands raw files on
//! - **Canonical transformer**: maps one raw file to one canonical Parquet file
//! - **Merge engine**: loads canonical files with SCD Type 1 or Type 2 semantics
//! - **Backfill coordinator**: drives the same path over historical ranges
//!
//! # External interfaces
//!
//! Object storage, the state store, secrets, source APIs, the analytical store
//! and compute dispatch are all traits. Each has a production implementation
//! (S3, Postgres, environment, HTTP, ClickHouse, outbox queue) and an in-memory
//! one used by tests.
//!
//! # Example
//!
//! ```no_run
//! use tidepool_engine::{config::EngineConfig, deadline::Deadline};
//!
//! # async fn run(processor: tidepool_engine::processor::ChunkProcessor, job_id: uuid::Uuid) -> tidepool_engine::Result<()> {
//! let config = EngineConfig::load()?;
//! let deadline = Deadline::from_config(&config.deadline);
//! let outcome = processor.process(job_id, 0, &deadline).await?;
//! println!("{} records", outcome.records_fetched);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod backfill;
pub mod canonical;
pub mod clients;
pub mod config;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod mapping;
pub mod merge;
pub mod metrics;
pub mod planner;
pub mod processor;
pub mod retry;
pub mod secrets;
pub mod source;
pub mod state;
pub mod storage;
pub mod tenant;

pub use error::{IngestError, Result};
