//! SCD merge engine
//!
//! Loads a known list of canonical files into one shared analytical table.
//! Each file goes through its own staging table, so one file failing leaves
//! the others (and files already merged in the same run) untouched.
//!
//! - Type 1: delete matching rows, then insert every staged row.
//! - Type 2: expire current rows whose hash changed, then insert only rows
//!   without an identical current row.
//!
//! At most one merge runs per (tenant, table); a lease in the state store
//! enforces it. A file already merged at its current modification time is
//! skipped, whatever order files arrive in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::canonical::dedup;
use crate::canonical::parquet as canonical_parquet;
use crate::canonical::record::{hash_cells, CanonicalRecord, ID};
use crate::dispatch::MergeRequest;
use crate::error::{IngestError, Result};
use crate::mapping::ScdType;
use crate::retry::RetryPolicy;
use crate::state::{JobError, StateStore};
use crate::storage::ObjectStore;

pub mod clickhouse;
pub mod memory;
pub mod store;

pub use clickhouse::ClickHouseStore;
pub use memory::MemoryAnalyticalStore;
pub use store::{AnalyticalStore, InsertMode, TargetRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Another merge holds the lease for this (tenant, table)
    Busy {
        tenant_id: String,
        canonical_table: String,
    },
    Completed {
        tenant_id: String,
        canonical_table: String,
        files_processed: usize,
        files_failed: usize,
        files_skipped: usize,
        rows_staged: u64,
        errors: Vec<JobError>,
    },
}

/// Parse a canonical timestamp, falling back to `fallback`
fn parse_ts(value: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// Canonical records -> target rows for one tenant.
///
/// Later occurrences of an id replace earlier ones, and every row gets a hash
/// recomputed from its business fields.
pub fn to_target_rows(
    records: Vec<CanonicalRecord>,
    tenant_id: &str,
    scd_type: ScdType,
    now: DateTime<Utc>,
) -> Result<Vec<TargetRow>> {
    let mut rows: Vec<TargetRow> = Vec::with_capacity(records.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        if record.tenant_id != tenant_id {
            return Err(IngestError::Merge(format!(
                "file holds rows of tenant {} but the merge is for tenant {}",
                record.tenant_id, tenant_id
            )));
        }
        let id = record
            .id()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IngestError::Merge("canonical row without id".into()))?
            .to_string();

        let data_hash = hash_cells(&record.fields);
        let created = parse_ts(&record.ingestion_timestamp, now);
        let effective_date = match scd_type {
            ScdType::Type1 => None,
            ScdType::Type2 => Some(
                record
                    .versioning
                    .as_ref()
                    .map(|v| parse_ts(&v.effective_start_date, created))
                    .unwrap_or(created),
            ),
        };

        let mut fields = record.fields;
        fields.remove(ID);

        let row = TargetRow {
            tenant_id: tenant_id.to_string(),
            source_id: id.clone(),
            id: id.clone(),
            fields,
            source_system: record.source_system,
            last_updated: now,
            created_date: created,
            data_hash,
            record_version: 1,
            effective_date,
            expiration_date: None,
            is_current: true,
        };

        match positions.get(&id) {
            Some(&at) => rows[at] = row,
            None => {
                positions.insert(id, rows.len());
                rows.push(row);
            },
        }
    }

    Ok(rows)
}

pub struct MergeEngine {
    objects: Arc<dyn ObjectStore>,
    state: Arc<dyn StateStore>,
    analytical: Arc<dyn AnalyticalStore>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    owner: String,
}

impl MergeEngine {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        state: Arc<dyn StateStore>,
        analytical: Arc<dyn AnalyticalStore>,
        retry: RetryPolicy,
        lease_ttl: Duration,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            objects,
            state,
            analytical,
            retry,
            lease_ttl,
            owner: format!("{}-{}", host, Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, table = %request.canonical_table, files = request.files.len())
    )]
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome> {
        store::validate_identifier(&request.canonical_table)?;

        let acquired = self
            .state
            .try_acquire_merge_lease(
                &request.tenant_id,
                &request.canonical_table,
                &self.owner,
                self.lease_ttl,
            )
            .await?;
        if !acquired {
            info!("Another merge holds the lease, skipping");
            return Ok(MergeOutcome::Busy {
                tenant_id: request.tenant_id,
                canonical_table: request.canonical_table,
            });
        }

        let result = self.merge_files(&request).await;

        if let Err(e) = self
            .state
            .release_merge_lease(&request.tenant_id, &request.canonical_table, &self.owner)
            .await
        {
            warn!(error = %e, "Failed to release merge lease; it will expire");
        }

        result
    }

    async fn merge_files(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let tenant_id = request.tenant_id.as_str();
        let table = request.canonical_table.as_str();

        let mut processed = 0;
        let mut skipped = 0;
        let mut rows_staged = 0;
        let mut errors = Vec::new();
        let mut newest: Option<DateTime<Utc>> = None;

        for key in dedup(&request.files) {
            let meta = match self.objects.head(&key).await {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    warn!(file = %key, "Canonical file does not exist");
                    errors.push(file_error(table, &key, "canonical file does not exist"));
                    continue;
                },
                Err(e) => {
                    warn!(file = %key, error = %e, "Failed to stat canonical file");
                    errors.push(file_error(table, &key, e.to_string()));
                    continue;
                },
            };

            let merged = self.state.get_merged_file(tenant_id, table, &key).await?;
            if merged.is_some_and(|at| meta.last_modified <= at) {
                debug!(file = %key, "Already merged, skipping");
                skipped += 1;
                continue;
            }

            match self.merge_file(request, &key).await {
                Ok(staged) => {
                    self.state
                        .record_merged_file(tenant_id, table, &key, meta.last_modified)
                        .await?;
                    processed += 1;
                    rows_staged += staged;
                    newest = newest.max(Some(meta.last_modified));
                },
                Err(e) => {
                    warn!(file = %key, error = %e, "Failed to merge canonical file");
                    errors.push(file_error(table, &key, e.to_string()));
                },
            }
        }

        if let Some(ts) = newest {
            self.state.set_merge_watermark(tenant_id, table, ts).await?;
        }

        let files_failed = errors.len();
        info!(
            processed,
            failed = files_failed,
            skipped,
            rows_staged,
            "Merge finished"
        );

        Ok(MergeOutcome::Completed {
            tenant_id: tenant_id.to_string(),
            canonical_table: table.to_string(),
            files_processed: processed,
            files_failed,
            files_skipped: skipped,
            rows_staged,
            errors,
        })
    }

    async fn merge_file(&self, request: &MergeRequest, key: &str) -> Result<u64> {
        let data = self.retry.run("read canonical file", |_| self.objects.get(key)).await?;
        let records = canonical_parquet::decode(data)?;
        if records.is_empty() {
            debug!(file = key, "Canonical file is empty");
            return Ok(0);
        }

        let scd_type = request.scd_type.unwrap_or_else(|| {
            if records.iter().any(|r| r.versioning.is_some()) {
                ScdType::Type2
            } else {
                ScdType::Type1
            }
        });

        let now = Utc::now();
        let rows = to_target_rows(records, &request.tenant_id, scd_type, now)?;
        let columns: Vec<String> = rows
            .iter()
            .flat_map(|r| r.fields.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect();

        let table = request.canonical_table.as_str();
        self.analytical.ensure_target_table(table, &columns, scd_type).await?;

        let staging = format!("{}_staging_{}", table, Uuid::new_v4().simple());
        self.analytical.create_staging(&staging, table).await?;

        let applied = self.apply(table, &staging, &request.tenant_id, &rows, scd_type, now).await;

        if let Err(e) = self.analytical.drop_staging(&staging).await {
            warn!(staging = %staging, error = %e, "Failed to drop staging table");
        }

        let inserted = applied?;
        debug!(
            file = key,
            scd_type = %scd_type,
            staged = rows.len(),
            inserted = ?inserted,
            "Merged canonical file"
        );
        Ok(rows.len() as u64)
    }

    async fn apply(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        rows: &[TargetRow],
        scd_type: ScdType,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        self.analytical.load_staging(staging, rows, scd_type).await?;
        match scd_type {
            ScdType::Type1 => {
                self.analytical.delete_matching(table, staging, tenant_id).await?;
                self.analytical
                    .insert_staged(table, staging, tenant_id, InsertMode::All)
                    .await
            },
            ScdType::Type2 => {
                self.analytical.expire_changed(table, staging, tenant_id, now).await?;
                self.analytical
                    .insert_staged(table, staging, tenant_id, InsertMode::MissingOrChanged)
                    .await
            },
        }
    }
}

fn file_error(table: &str, key: &str, message: impl Into<String>) -> JobError {
    JobError {
        chunk_id: None,
        table: Some(table.to_string()),
        file: Some(key.to_string()),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::record::{RecordMapper, VersionColumns};
    use crate::mapping::{MappingDocument, TableMapping};
    use crate::state::MemoryStateStore;
    use crate::storage::{MemoryObjectStore, CONTENT_TYPE_PARQUET};
    use serde_json::{json, Value};

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        state: Arc<MemoryStateStore>,
        analytical: Arc<MemoryAnalyticalStore>,
        engine: MergeEngine,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let state = Arc::new(MemoryStateStore::new());
        let analytical = Arc::new(MemoryAnalyticalStore::new());
        let engine = MergeEngine::new(
            objects.clone(),
            state.clone(),
            analytical.clone(),
            RetryPolicy::default(),
            Duration::from_secs(60),
        );
        Fixture {
            objects,
            state,
            analytical,
            engine,
        }
    }

    fn mapping(scd: &str) -> TableMapping {
        let doc: MappingDocument = serde_json::from_value(json!({
            "canonical_table": "companies",
            "scd_type": scd,
            "fields": { "id": "id", "name": "name" }
        }))
        .unwrap();
        TableMapping::from_document("connectwise", "companies", doc).unwrap()
    }

    async fn put_file(fx: &Fixture, key: &str, scd: &str, records: &[Value]) -> String {
        let mapping = mapping(scd);
        let mapper = RecordMapper {
            tenant_id: "acme",
            source_system: "connectwise",
            mapping: &mapping,
            ingested_at: Utc::now(),
        };
        let records: Vec<CanonicalRecord> = records.iter().map(|r| mapper.map(r).unwrap()).collect();
        let body = canonical_parquet::encode(&mapping, &records).unwrap();
        fx.objects.put(key, body, CONTENT_TYPE_PARQUET).await.unwrap();
        key.to_string()
    }

    fn request(files: Vec<String>, scd: Option<ScdType>) -> MergeRequest {
        MergeRequest {
            tenant_id: "acme".into(),
            canonical_table: "companies".into(),
            files,
            scd_type: scd,
        }
    }

    fn completed(outcome: MergeOutcome) -> (usize, usize, usize) {
        match outcome {
            MergeOutcome::Completed {
                files_processed,
                files_failed,
                files_skipped,
                ..
            } => (files_processed, files_failed, files_skipped),
            MergeOutcome::Busy { .. } => panic!("unexpected busy outcome"),
        }
    }

    #[test]
    fn test_last_occurrence_wins() {
        let now = Utc::now();
        let record = |name: &str| CanonicalRecord {
            tenant_id: "acme".into(),
            source_system: "cw".into(),
            source_table: "companies".into(),
            canonical_table: "companies".into(),
            ingestion_timestamp: now.to_rfc3339(),
            record_hash: "stale".into(),
            fields: [("id".to_string(), Some("1".to_string())), ("name".to_string(), Some(name.to_string()))]
                .into_iter()
                .collect(),
            versioning: Some(VersionColumns {
                effective_start_date: now.to_rfc3339(),
                effective_end_date: None,
                is_current: true,
            }),
        };

        let rows = to_target_rows(vec![record("old"), record("new")], "acme", ScdType::Type2, now).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["name"], Some("new".to_string()));
        assert_ne!(rows[0].data_hash, "stale");
        assert!(!rows[0].fields.contains_key("id"));
        assert!(rows[0].effective_date.is_some());
    }

    #[test]
    fn test_foreign_tenant_rows_are_rejected() {
        let now = Utc::now();
        let record = CanonicalRecord {
            tenant_id: "globex".into(),
            source_system: "cw".into(),
            source_table: "companies".into(),
            canonical_table: "companies".into(),
            ingestion_timestamp: now.to_rfc3339(),
            record_hash: String::new(),
            fields: [("id".to_string(), Some("1".to_string()))].into_iter().collect(),
            versioning: None,
        };
        assert!(to_target_rows(vec![record], "acme", ScdType::Type1, now).is_err());
    }

    #[tokio::test]
    async fn test_type1_upsert_is_idempotent() {
        let fx = fixture();
        let first = put_file(&fx, "acme/canonical/companies/companies/r1/00000.parquet", "type_1", &[
            json!({ "id": "A", "name": "Alpha" }),
            json!({ "id": "B", "name": "Beta" }),
        ])
        .await;
        let second = put_file(&fx, "acme/canonical/companies/companies/r2/00000.parquet", "type_1", &[
            json!({ "id": "B", "name": "Beta v2" }),
        ])
        .await;

        let outcome = fx.engine.merge(request(vec![first.clone(), second.clone()], Some(ScdType::Type1))).await.unwrap();
        assert_eq!(completed(outcome), (2, 0, 0));

        let rows = fx.analytical.rows("companies");
        assert_eq!(rows.len(), 2);
        let b = rows.iter().find(|r| r.id == "B").unwrap();
        assert_eq!(b.fields["name"], Some("Beta v2".to_string()));
        assert!(rows.iter().all(|r| r.record_version == 1));

        // Second run is a no-op: both files are recorded as merged
        let again = fx.engine.merge(request(vec![first, second], Some(ScdType::Type1))).await.unwrap();
        assert_eq!(completed(again), (0, 0, 2));
        assert_eq!(fx.analytical.rows("companies").len(), 2);
        assert_eq!(fx.analytical.staging_tables(), 0);
    }

    #[tokio::test]
    async fn test_type2_keeps_history_without_duplicates() {
        let fx = fixture();
        let first = put_file(&fx, "acme/canonical/companies/companies/r1/00000.parquet", "type_2", &[
            json!({ "id": "A", "name": "Alpha" }),
            json!({ "id": "B", "name": "Beta" }),
        ])
        .await;
        fx.engine.merge(request(vec![first], None)).await.unwrap();

        let second = put_file(&fx, "acme/canonical/companies/companies/r2/00000.parquet", "type_2", &[
            json!({ "id": "A", "name": "Alpha" }),
            json!({ "id": "B", "name": "Beta v2" }),
        ])
        .await;
        fx.engine.merge(request(vec![second], None)).await.unwrap();

        let rows = fx.analytical.rows("companies");
        let a: Vec<_> = rows.iter().filter(|r| r.id == "A").collect();
        let b: Vec<_> = rows.iter().filter(|r| r.id == "B").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);

        let current_b: Vec<_> = b.iter().filter(|r| r.is_current).collect();
        assert_eq!(current_b.len(), 1);
        assert_eq!(current_b[0].fields["name"], Some("Beta v2".to_string()));
        assert_eq!(current_b[0].record_version, 2);

        let expired = b.iter().find(|r| !r.is_current).unwrap();
        assert!(expired.expiration_date.is_some());
    }

    #[tokio::test]
    async fn test_one_bad_file_does_not_block_the_rest() {
        let fx = fixture();
        let bad = put_file(&fx, "acme/canonical/companies/companies/r1/00000.parquet", "type_1", &[
            json!({ "id": "POISON", "name": "x" }),
        ])
        .await;
        let good = put_file(&fx, "acme/canonical/companies/companies/r1/00001.parquet", "type_1", &[
            json!({ "id": "A", "name": "Alpha" }),
        ])
        .await;
        fx.analytical.fail_loads_with_id("POISON");

        let outcome = fx
            .engine
            .merge(request(vec![bad.clone(), good.clone(), "acme/missing.parquet".into()], Some(ScdType::Type1)))
            .await
            .unwrap();
        assert_eq!(completed(outcome), (1, 2, 0));
        assert_eq!(fx.analytical.rows("companies").len(), 1);
        assert_eq!(fx.analytical.staging_tables(), 0);

        // Only the failed file runs again on a retry
        fx.analytical.clear_failures();
        let retry = fx
            .engine
            .merge(request(vec![bad, good], Some(ScdType::Type1)))
            .await
            .unwrap();
        assert_eq!(completed(retry), (1, 0, 1));
        assert_eq!(fx.analytical.rows("companies").len(), 2);
    }

    #[tokio::test]
    async fn test_older_file_merged_after_newer_one_is_not_skipped() {
        let fx = fixture();
        let older = put_file(&fx, "acme/canonical/companies/companies/t0/00000.parquet", "type_1", &[
            json!({ "id": "A", "name": "Alpha" }),
        ])
        .await;
        let newer = put_file(&fx, "acme/canonical/companies/companies/t1/00000.parquet", "type_1", &[
            json!({ "id": "B", "name": "Beta" }),
        ])
        .await;

        let first = fx.engine.merge(request(vec![newer], Some(ScdType::Type1))).await.unwrap();
        assert_eq!(completed(first), (1, 0, 0));
        let second = fx.engine.merge(request(vec![older], Some(ScdType::Type1))).await.unwrap();
        assert_eq!(completed(second), (1, 0, 0));

        let mut ids: Vec<_> = fx.analytical.rows("companies").into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_rewritten_file_is_merged_again() {
        let fx = fixture();
        let key = "acme/canonical/companies/companies/r1/00000.parquet";
        put_file(&fx, key, "type_1", &[json!({ "id": "A", "name": "Alpha" })]).await;
        fx.engine.merge(request(vec![key.into()], Some(ScdType::Type1))).await.unwrap();

        put_file(&fx, key, "type_1", &[json!({ "id": "A", "name": "Alpha v2" })]).await;
        let outcome = fx.engine.merge(request(vec![key.into()], Some(ScdType::Type1))).await.unwrap();
        assert_eq!(completed(outcome), (1, 0, 0));
        assert_eq!(fx.analytical.rows("companies")[0].fields["name"], Some("Alpha v2".to_string()));
    }

    #[tokio::test]
    async fn test_busy_when_lease_is_held() {
        let fx = fixture();
        fx.state
            .try_acquire_merge_lease("acme", "companies", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = fx.engine.merge(request(vec!["x".into()], None)).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn test_lease_is_released_after_run() {
        let fx = fixture();
        fx.engine.merge(request(vec![], None)).await.unwrap();
        assert!(fx
            .state
            .try_acquire_merge_lease("acme", "companies", "next", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_invalid_table_name() {
        let fx = fixture();
        let mut req = request(vec![], None);
        req.canonical_table = "companies; DROP".into();
        assert!(fx.engine.merge(req).await.unwrap_err().is_config());
    }
}
