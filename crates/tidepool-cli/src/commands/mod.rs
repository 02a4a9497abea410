//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function. Commands share
//! one [`Services`] built from [`EngineConfig`].

pub mod aggregate;
pub mod backfill;
pub mod merge;
pub mod migrate;
pub mod plan;
pub mod process;
pub mod request;
pub mod transform;

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tidepool_engine::aggregator::ResultAggregator;
use tidepool_engine::backfill::BackfillCoordinator;
use tidepool_engine::canonical::CanonicalTransformer;
use tidepool_engine::clients::ClientRegistry;
use tidepool_engine::config::EngineConfig;
use tidepool_engine::deadline::Deadline;
use tidepool_engine::dispatch::QueueDispatcher;
use tidepool_engine::mapping::{FileMappingLoader, MappingRegistry};
use tidepool_engine::merge::{ClickHouseStore, MergeEngine};
use tidepool_engine::metrics::TracingMetrics;
use tidepool_engine::planner::ChunkPlanner;
use tidepool_engine::processor::ChunkProcessor;
use tidepool_engine::retry::RetryPolicy;
use tidepool_engine::secrets::EnvSecretStore;
use tidepool_engine::source::HttpSource;
use tidepool_engine::state::PgStateStore;
use tidepool_engine::storage::S3ObjectStore;
use tidepool_engine::tenant::TenantResolver;
use tracing::debug;

use crate::error::{CliError, Result};

/// Production wiring of every pipeline component
pub struct Services {
    pub config: EngineConfig,
    pub state: Arc<PgStateStore>,
    pub planner: Arc<ChunkPlanner>,
    pub processor: Arc<ChunkProcessor>,
    pub aggregator: Arc<ResultAggregator>,
    pub transformer: CanonicalTransformer,
    pub merger: MergeEngine,
    pub backfill: BackfillCoordinator,
}

impl Services {
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let state = Arc::new(PgStateStore::connect(&config.database).await?);
        let objects = Arc::new(S3ObjectStore::new(&config.storage));
        let analytical = Arc::new(ClickHouseStore::new(&config.analytical)?);
        let clients = Arc::new(ClientRegistry::default());
        let source = Arc::new(HttpSource::new(clients));
        let resolver = Arc::new(TenantResolver::new(state.clone(), Arc::new(EnvSecretStore::default())));
        let dispatcher = Arc::new(QueueDispatcher::new(&config.dispatch.outbox_dir));
        let mappings = Arc::new(MappingRegistry::new(
            Box::new(FileMappingLoader::new(&config.mapping.dir)),
            config.mapping.cache_capacity,
        ));
        let retry = RetryPolicy::from_config(&config.retry);

        let planner = Arc::new(ChunkPlanner::new(
            state.clone(),
            source.clone(),
            resolver.clone(),
            config.chunking.clone(),
        ));
        let processor = Arc::new(ChunkProcessor::new(
            state.clone(),
            objects.clone(),
            source,
            resolver,
            retry,
            &config.chunking,
        ));
        let aggregator = Arc::new(ResultAggregator::new(
            state.clone(),
            dispatcher.clone(),
            Arc::new(TracingMetrics),
        ));
        let transformer = CanonicalTransformer::new(
            objects.clone(),
            state.clone(),
            mappings,
            dispatcher.clone(),
            retry,
        );
        let merger = MergeEngine::new(
            objects,
            state.clone(),
            analytical,
            retry,
            Duration::from_secs(config.merge.lease_ttl_secs),
        );
        let backfill = BackfillCoordinator::new(
            state.clone(),
            planner.clone(),
            processor.clone(),
            aggregator.clone(),
            dispatcher,
        );

        debug!(outbox = %config.dispatch.outbox_dir.display(), "Services ready");

        Ok(Self {
            config,
            state,
            planner,
            processor,
            aggregator,
            transformer,
            merger,
            backfill,
        })
    }

    /// Deadline for this invocation, with `budget_secs` overriding the configured budget
    pub fn deadline(&self, budget_secs: Option<u64>) -> Deadline {
        match budget_secs {
            Some(secs) => Deadline::from_budget(
                Duration::from_secs(secs),
                Duration::from_secs(self.config.deadline.safety_buffer_secs),
            ),
            None => Deadline::from_config(&self.config.deadline),
        }
    }
}

/// Print an outcome for the orchestrator
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read and parse a JSON file given on the command line
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path).await.map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}
