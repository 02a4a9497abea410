//! Shared wiring for pipeline integration tests
//!
//! Every external system is replaced by its in-memory implementation, and the
//! dispatch hops (aggregator -> transformer -> merge engine) are driven by
//! hand from what the recording dispatcher captured.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tidepool_engine::aggregator::{AggregateOutcome, ResultAggregator};
use tidepool_engine::backfill::BackfillCoordinator;
use tidepool_engine::canonical::{CanonicalTransformer, TransformOutcome};
use tidepool_engine::config::ChunkingConfig;
use tidepool_engine::deadline::Deadline;
use tidepool_engine::dispatch::{MergeRequest, RecordingDispatcher, TransformRequest};
use tidepool_engine::mapping::{MappingRegistry, ScdType, StaticMappingLoader};
use tidepool_engine::merge::{MemoryAnalyticalStore, MergeEngine, MergeOutcome};
use tidepool_engine::metrics::MemoryMetrics;
use tidepool_engine::planner::{ChunkPlanner, PlanRequest};
use tidepool_engine::processor::{ChunkOutcome, ChunkProcessor};
use tidepool_engine::retry::RetryPolicy;
use tidepool_engine::secrets::MemorySecretStore;
use tidepool_engine::source::{PageRequest, SourceApi};
use tidepool_engine::state::{ChunkStatus, DateWindow, MemoryStateStore, StateStore, TenantServiceRecord};
use tidepool_engine::storage::MemoryObjectStore;
use tidepool_engine::tenant::{TenantCredentials, TenantResolver};
use tidepool_engine::Result;
use uuid::Uuid;

pub const TENANT: &str = "acme";
pub const SERVICE: &str = "psa";
pub const SOURCE_SYSTEM: &str = "connectwise";

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tidepool_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Source that takes `per_page` of (paused) time for every page
pub struct SlowSource {
    pub inner: Arc<dyn SourceApi>,
    pub per_page: Duration,
}

#[async_trait]
impl SourceApi for SlowSource {
    async fn count(
        &self,
        creds: &TenantCredentials,
        table: &str,
        window: Option<&DateWindow>,
    ) -> Result<Option<u64>> {
        self.inner.count(creds, table, window).await
    }

    async fn fetch_page(&self, creds: &TenantCredentials, request: &PageRequest) -> Result<Vec<Value>> {
        tokio::time::sleep(self.per_page).await;
        self.inner.fetch_page(creds, request).await
    }
}

pub struct Pipeline {
    pub state: Arc<MemoryStateStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub analytical: Arc<MemoryAnalyticalStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub metrics: Arc<MemoryMetrics>,
    pub planner: Arc<ChunkPlanner>,
    pub processor: Arc<ChunkProcessor>,
    pub aggregator: Arc<ResultAggregator>,
    pub transformer: CanonicalTransformer,
    pub merger: MergeEngine,
}

pub struct PipelineBuilder {
    source: Arc<dyn SourceApi>,
    chunking: ChunkingConfig,
    mappings: StaticMappingLoader,
    endpoints: Vec<String>,
}

impl PipelineBuilder {
    pub fn new(source: Arc<dyn SourceApi>) -> Self {
        Self {
            source,
            chunking: ChunkingConfig::default(),
            mappings: StaticMappingLoader::new(),
            endpoints: vec!["companies".into(), "tickets".into()],
        }
    }

    pub fn chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn mapping(mut self, table: &str, doc: Value) -> Self {
        self.mappings = self.mappings.with(SOURCE_SYSTEM, table, doc);
        self
    }

    pub async fn build(self) -> Pipeline {
        let state = Arc::new(MemoryStateStore::new());
        state
            .put_tenant_service(&TenantServiceRecord {
                tenant_id: TENANT.into(),
                service: SERVICE.into(),
                secret_ref: "acme/psa".into(),
                enabled_endpoints: self.endpoints,
                source_system: SOURCE_SYSTEM.into(),
            })
            .await
            .expect("tenant service record");

        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert("acme/psa", json!({ "base_url": "http://unused" }));
        let resolver = Arc::new(TenantResolver::new(state.clone(), secrets));

        let objects = Arc::new(MemoryObjectStore::new());
        let analytical = Arc::new(MemoryAnalyticalStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let retry = RetryPolicy::new(2, Duration::from_millis(1));

        let planner = Arc::new(ChunkPlanner::new(
            state.clone(),
            self.source.clone(),
            resolver.clone(),
            self.chunking.clone(),
        ));
        let processor = Arc::new(ChunkProcessor::new(
            state.clone(),
            objects.clone(),
            self.source,
            resolver,
            retry,
            &self.chunking,
        ));
        let aggregator = Arc::new(ResultAggregator::new(state.clone(), dispatcher.clone(), metrics.clone()));
        let transformer = CanonicalTransformer::new(
            objects.clone(),
            state.clone(),
            Arc::new(MappingRegistry::new(Box::new(self.mappings), 16)),
            dispatcher.clone(),
            retry,
        );
        let merger = MergeEngine::new(
            objects.clone(),
            state.clone(),
            analytical.clone(),
            retry,
            Duration::from_secs(60),
        );

        Pipeline {
            state,
            objects,
            analytical,
            dispatcher,
            metrics,
            planner,
            processor,
            aggregator,
            transformer,
            merger,
        }
    }
}

pub fn companies_mapping(scd: ScdType) -> Value {
    json!({
        "canonical_table": "companies",
        "scd_type": scd.as_str(),
        "fields": { "id": "id", "name": "companyName", "city": "address.city" }
    })
}

pub fn company(id: &str, name: &str) -> Value {
    json!({ "id": id, "companyName": name, "address": { "city": "Springfield" } })
}

impl Pipeline {
    pub fn backfill(&self) -> BackfillCoordinator {
        BackfillCoordinator::new(
            self.state.clone(),
            self.planner.clone(),
            self.processor.clone(),
            self.aggregator.clone(),
            self.dispatcher.clone(),
        )
    }

    /// Plan, process every chunk to completion and aggregate with forwarding
    pub async fn ingest(&self, table: &str) -> Result<AggregateOutcome> {
        let plan = self
            .planner
            .plan(&PlanRequest {
                tenant_id: TENANT.into(),
                service: SERVICE.into(),
                table_name: table.into(),
                start_date: Some("2024-01-01".into()),
                end_date: Some("2024-01-31".into()),
                chunk_size_days: None,
            })
            .await?;

        let mut outcomes = Vec::new();
        for chunk in &plan.chunks {
            outcomes.push(self.process_to_end(plan.job.job_id, chunk.chunk_id).await?);
        }
        self.aggregator.aggregate_job(plan.job.job_id, outcomes, true).await
    }

    /// Re-invoke a chunk until it is no longer a continuation
    pub async fn process_to_end(&self, job_id: Uuid, chunk_id: u32) -> Result<ChunkOutcome> {
        loop {
            let outcome = self
                .processor
                .process(job_id, chunk_id, &Deadline::after(Duration::from_secs(600)))
                .await?;
            if outcome.status != ChunkStatus::TimeoutContinuation {
                return Ok(outcome);
            }
        }
    }

    /// Run a transform, then the merge it dispatched
    pub async fn transform_and_merge(
        &self,
        request: TransformRequest,
    ) -> Result<(TransformOutcome, Option<MergeOutcome>)> {
        let before = self.dispatcher.merges().len();
        let transformed = self.transformer.transform(request).await?;

        let merges: Vec<MergeRequest> = self.dispatcher.merges().into_iter().skip(before).collect();
        let mut merged = None;
        for request in merges {
            merged = Some(self.merger.merge(request).await?);
        }
        Ok((transformed, merged))
    }

    /// Full path for one table: ingest, transform forwarded files, merge
    pub async fn run(&self, table: &str) -> Result<AggregateOutcome> {
        let aggregate = self.ingest(table).await?;
        for request in aggregate.transforms.clone() {
            self.transform_and_merge(request).await?;
        }
        Ok(aggregate)
    }
}
