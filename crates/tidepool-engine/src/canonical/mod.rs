//! Canonical transformer
//!
//! Maps raw batch files to canonical Parquet files, strictly one file at a
//! time so memory stays bounded by the largest single file. Records missing a
//! required business field are dropped, never written as metadata-only rows.
//! Each input file produces exactly one output file, and that exact output list
//! is handed to the merge engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{Dispatcher, MergeRequest, TransformRequest};
use crate::error::{IngestError, Result};
use crate::mapping::{MappingRegistry, ScdType, TableMapping};
use crate::retry::RetryPolicy;
use crate::state::{JobError, StateStore};
use crate::storage::keys::{canonical_key, raw_prefix};
use crate::storage::{jsonl, ObjectStore, CONTENT_TYPE_PARQUET};

pub mod parquet;
pub mod record;

pub use record::{CanonicalRecord, RecordMapper};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    pub canonical_table: String,
    pub scd_type: ScdType,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub failed_files: Vec<JobError>,
    pub merge_dispatched: bool,
}

struct FileResult {
    output_key: String,
    records_in: u64,
    records_out: u64,
    modified: DateTime<Utc>,
}

pub struct CanonicalTransformer {
    objects: Arc<dyn ObjectStore>,
    state: Arc<dyn StateStore>,
    mappings: Arc<MappingRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    retry: RetryPolicy,
}

impl CanonicalTransformer {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        state: Arc<dyn StateStore>,
        mappings: Arc<MappingRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            objects,
            state,
            mappings,
            dispatcher,
            retry,
        }
    }

    /// Transform the requested files, or discover new raw files when none are given
    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, service = %request.service, table = %request.table_name)
    )]
    pub async fn transform(&self, request: TransformRequest) -> Result<TransformOutcome> {
        let source_system = self
            .state
            .get_tenant_service(&request.tenant_id, &request.service)
            .await?
            .map(|r| r.source_system)
            .unwrap_or_else(|| request.service.clone());

        let mapping = self.mappings.get(&source_system, &request.table_name).await?;
        parquet::canonical_schema(&mapping)?;

        let input_files = match &request.files {
            Some(files) => dedup(files),
            None => self.discover(&request).await?,
        };

        let mut outcome = TransformOutcome {
            tenant_id: request.tenant_id.clone(),
            service: request.service.clone(),
            table_name: request.table_name.clone(),
            canonical_table: mapping.canonical_table.clone(),
            scd_type: mapping.scd_type(),
            input_files: input_files.clone(),
            output_files: Vec::new(),
            records_in: 0,
            records_out: 0,
            records_dropped: 0,
            failed_files: Vec::new(),
            merge_dispatched: false,
        };

        if input_files.is_empty() {
            info!("No raw files to transform");
            return Ok(outcome);
        }

        let mapper = RecordMapper {
            tenant_id: &request.tenant_id,
            source_system: &source_system,
            mapping: &mapping,
            ingested_at: Utc::now(),
        };
        let mut newest: Option<DateTime<Utc>> = None;

        for (ordinal, key) in input_files.iter().enumerate() {
            match self.transform_file(&mapper, key, ordinal).await {
                Ok(file) => {
                    outcome.records_in += file.records_in;
                    outcome.records_out += file.records_out;
                    outcome.records_dropped += file.records_in - file.records_out;
                    outcome.output_files.push(file.output_key);
                    newest = newest.max(Some(file.modified));
                },
                Err(e) => {
                    warn!(file = %key, error = %e, "Failed to transform raw file");
                    outcome.failed_files.push(JobError {
                        chunk_id: None,
                        table: Some(request.table_name.clone()),
                        file: Some(key.clone()),
                        message: e.to_string(),
                    });
                },
            }
        }

        // A failed file stays behind the watermark so discovery picks it up again
        if let (Some(newest), true) = (newest, outcome.failed_files.is_empty()) {
            self.state
                .set_transform_watermark(
                    &request.tenant_id,
                    &request.service,
                    &request.table_name,
                    newest,
                )
                .await?;
        }

        if !outcome.output_files.is_empty() {
            self.dispatcher
                .dispatch_merge(MergeRequest {
                    tenant_id: request.tenant_id.clone(),
                    canonical_table: mapping.canonical_table.clone(),
                    files: outcome.output_files.clone(),
                    scd_type: Some(mapping.scd_type()),
                })
                .await?;
            outcome.merge_dispatched = true;
        }

        info!(
            canonical_table = %outcome.canonical_table,
            files_in = outcome.input_files.len(),
            files_out = outcome.output_files.len(),
            files_failed = outcome.failed_files.len(),
            records_in = outcome.records_in,
            records_out = outcome.records_out,
            records_dropped = outcome.records_dropped,
            "Canonical transform finished"
        );

        Ok(outcome)
    }

    /// Raw files of the table, newer than the last-transformed watermark unless forced
    async fn discover(&self, request: &TransformRequest) -> Result<Vec<String>> {
        let prefix = raw_prefix(&request.tenant_id, &request.service, &request.table_name);
        let watermark = if request.force_reprocess {
            None
        } else {
            self.state
                .get_transform_watermark(&request.tenant_id, &request.service, &request.table_name)
                .await?
        };

        let listed = self.retry.run("list raw files", |_| self.objects.list(&prefix)).await?;
        let total = listed.len();
        let files: Vec<String> = listed
            .into_iter()
            .filter(|meta| meta.key.ends_with(".jsonl"))
            .filter(|meta| watermark.is_none_or(|w| meta.last_modified > w))
            .map(|meta| meta.key)
            .collect();

        debug!(
            prefix = %prefix,
            listed = total,
            selected = files.len(),
            force = request.force_reprocess,
            "Discovered raw files"
        );
        Ok(files)
    }

    async fn transform_file(
        &self,
        mapper: &RecordMapper<'_>,
        key: &str,
        ordinal: usize,
    ) -> Result<FileResult> {
        let meta = self
            .objects
            .head(key)
            .await?
            .ok_or_else(|| IngestError::Storage(format!("raw file {} does not exist", key)))?;

        let data = self.retry.run("read raw file", |_| self.objects.get(key)).await?;
        let raw = jsonl::decode(&data)?;
        drop(data);

        let records_in = raw.len() as u64;
        let mut records = Vec::with_capacity(raw.len());
        for source in &raw {
            match mapper.map(source) {
                Ok(record) => records.push(record),
                Err(dropped) => debug!(
                    file = key,
                    missing = ?dropped.missing,
                    "Dropping record without required fields"
                ),
            }
        }
        drop(raw);

        let records_out = records.len() as u64;
        if records_out < records_in {
            warn!(
                file = key,
                dropped = records_in - records_out,
                "Records failed the required-field check"
            );
        }

        let mapping: &TableMapping = mapper.mapping;
        let body = parquet::encode(mapping, &records)?;
        drop(records);

        let output_key = canonical_key(
            mapper.tenant_id,
            &mapping.canonical_table,
            &mapping.source_table,
            mapper.ingested_at,
            ordinal,
        );
        self.retry
            .run("write canonical file", |_| {
                self.objects.put(&output_key, body.clone(), CONTENT_TYPE_PARQUET)
            })
            .await?;

        debug!(input = key, output = %output_key, records_out, "Wrote canonical file");

        Ok(FileResult {
            output_key,
            records_in,
            records_out,
            modified: meta.last_modified,
        })
    }
}

/// Drop repeated keys, keeping first-seen order
pub(crate) fn dedup(files: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    files.iter().filter(|f| seen.insert(f.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingDispatcher;
    use crate::mapping::StaticMappingLoader;
    use crate::state::{MemoryStateStore, TenantServiceRecord};
    use crate::storage::keys::raw_segment_key;
    use crate::storage::{MemoryObjectStore, CONTENT_TYPE_JSONL};
    use serde_json::{json, Value};

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        state: Arc<MemoryStateStore>,
        dispatcher: Arc<RecordingDispatcher>,
        transformer: CanonicalTransformer,
    }

    async fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let state = Arc::new(MemoryStateStore::new());
        state
            .put_tenant_service(&TenantServiceRecord {
                tenant_id: "acme".into(),
                service: "psa".into(),
                secret_ref: "acme/psa".into(),
                enabled_endpoints: vec!["companies".into()],
                source_system: "connectwise".into(),
            })
            .await
            .unwrap();

        let loader = StaticMappingLoader::new().with(
            "connectwise",
            "companies",
            json!({
                "canonical_table": "companies",
                "scd_type": "type_2",
                "fields": { "id": "id", "name": "companyName" }
            }),
        );
        let mappings = Arc::new(MappingRegistry::new(Box::new(loader), 8));
        let dispatcher = Arc::new(RecordingDispatcher::new());

        let transformer = CanonicalTransformer::new(
            objects.clone(),
            state.clone(),
            mappings,
            dispatcher.clone(),
            RetryPolicy::default(),
        );

        Fixture {
            objects,
            state,
            dispatcher,
            transformer,
        }
    }

    async fn put_raw(objects: &MemoryObjectStore, chunk_id: u32, records: &[Value]) -> String {
        let key = raw_segment_key("acme", "psa", "companies", Utc::now(), chunk_id, 0);
        objects.put(&key, jsonl::encode(records).unwrap(), CONTENT_TYPE_JSONL).await.unwrap();
        key
    }

    fn request(files: Option<Vec<String>>) -> TransformRequest {
        TransformRequest {
            tenant_id: "acme".into(),
            service: "psa".into(),
            table_name: "companies".into(),
            files,
            force_reprocess: false,
        }
    }

    #[tokio::test]
    async fn test_one_output_per_input_and_gate() {
        let fx = fixture().await;
        let a = put_raw(
            &fx.objects,
            0,
            &[json!({ "id": 1, "companyName": "A" }), json!({ "id": 2 })],
        )
        .await;
        let b = put_raw(&fx.objects, 1, &[json!({ "companyName": "no id" })]).await;

        let outcome = fx.transformer.transform(request(Some(vec![a, b]))).await.unwrap();
        assert_eq!(outcome.output_files.len(), 2);
        assert_eq!(outcome.records_in, 3);
        assert_eq!(outcome.records_out, 1);
        assert_eq!(outcome.records_dropped, 2);

        let first = parquet::decode(fx.objects.get(&outcome.output_files[0]).await.unwrap()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), Some("1"));
        let second = parquet::decode(fx.objects.get(&outcome.output_files[1]).await.unwrap()).unwrap();
        assert!(second.is_empty());

        let merges = fx.dispatcher.merges();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].files, outcome.output_files);
        assert_eq!(merges[0].scd_type, Some(ScdType::Type2));
    }

    #[tokio::test]
    async fn test_unreadable_file_does_not_stop_the_rest() {
        let fx = fixture().await;
        let good = put_raw(&fx.objects, 0, &[json!({ "id": 1, "companyName": "A" })]).await;
        let bad = "acme/raw/psa/companies/x/chunk-9-00000000.jsonl".to_string();
        fx.objects
            .put(&bad, bytes::Bytes::from_static(b"{broken"), CONTENT_TYPE_JSONL)
            .await
            .unwrap();
        let missing = "acme/raw/psa/companies/x/gone.jsonl".to_string();

        let outcome = fx
            .transformer
            .transform(request(Some(vec![bad.clone(), good, missing])))
            .await
            .unwrap();

        assert_eq!(outcome.output_files.len(), 1);
        assert_eq!(outcome.failed_files.len(), 2);
        assert_eq!(outcome.failed_files[0].file.as_deref(), Some(bad.as_str()));
        let watermark = fx.state.get_transform_watermark("acme", "psa", "companies").await.unwrap();
        assert!(watermark.is_none());
    }

    #[tokio::test]
    async fn test_discovery_respects_watermark_unless_forced() {
        let fx = fixture().await;
        put_raw(&fx.objects, 0, &[json!({ "id": 1, "companyName": "A" })]).await;

        let first = fx.transformer.transform(request(None)).await.unwrap();
        assert_eq!(first.input_files.len(), 1);

        let again = fx.transformer.transform(request(None)).await.unwrap();
        assert!(again.input_files.is_empty());
        assert!(!again.merge_dispatched);

        put_raw(&fx.objects, 1, &[json!({ "id": 2, "companyName": "B" })]).await;
        let newer = fx.transformer.transform(request(None)).await.unwrap();
        assert_eq!(newer.input_files.len(), 1);

        let mut forced = request(None);
        forced.force_reprocess = true;
        let all = fx.transformer.transform(forced).await.unwrap();
        assert_eq!(all.input_files.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_mapping_fails_the_run() {
        let fx = fixture().await;
        let mut req = request(Some(vec![]));
        req.table_name = "invoices".into();
        assert!(fx.transformer.transform(req).await.unwrap_err().is_config());
    }

    #[test]
    fn test_dedup_keeps_first_seen_order() {
        let files = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedup(&files), vec!["b".to_string(), "a".to_string()]);
    }
}
