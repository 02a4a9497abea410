//! Declarative field mappings from source records to canonical tables
//!
//! One mapping per (source system, source table), stored as
//! `{mapping_dir}/{source_system}/{source_table}.json`:
//!
//! ```json
//! {
//!   "canonical_table": "companies",
//!   "scd_type": "type_2",
//!   "fields": { "id": "id", "name": "companyName", "city": "address.city" }
//! }
//! ```

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::canonical::record::RESERVED_COLUMNS;
use crate::error::{IngestError, Result};
use crate::merge::store::{validate_identifier, TARGET_METADATA_COLUMNS};

pub mod path;

pub use path::FieldPath;

/// Change-tracking discipline of a canonical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScdType {
    /// Overwrite in place
    #[default]
    #[serde(rename = "type_1")]
    Type1,
    /// Versioned history
    #[serde(rename = "type_2")]
    Type2,
}

impl ScdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScdType::Type1 => "type_1",
            ScdType::Type2 => "type_2",
        }
    }

    /// Parse a configured value. Absent or unrecognised values fall back to
    /// type 1; type 2 is only ever chosen explicitly.
    pub fn from_config(raw: Option<&str>, canonical_table: &str) -> ScdType {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            None => ScdType::Type1,
            Some(s) => match s.as_str() {
                "type_1" | "type1" | "1" => ScdType::Type1,
                "type_2" | "type2" | "2" => ScdType::Type2,
                _ => {
                    warn!(
                        canonical_table,
                        value = %s,
                        "Invalid scd_type, defaulting to type_1"
                    );
                    ScdType::Type1
                },
            },
        }
    }
}

impl fmt::Display for ScdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per canonical table SCD configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScdConfig {
    pub canonical_table: String,
    pub scd_type: ScdType,
}

/// Raw mapping file contents
#[derive(Debug, Clone, Deserialize)]
pub struct MappingDocument {
    pub canonical_table: String,
    #[serde(default)]
    pub scd_type: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// Validated mapping for one (source system, source table)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub source_system: String,
    pub source_table: String,
    pub canonical_table: String,
    pub scd: TableScdConfig,
    /// canonical field -> source path, ordered by canonical field name
    pub fields: Vec<(String, FieldPath)>,
}

impl TableMapping {
    pub fn from_document(
        source_system: &str,
        source_table: &str,
        doc: MappingDocument,
    ) -> Result<Self> {
        if doc.canonical_table.trim().is_empty() {
            return Err(IngestError::Config(format!(
                "mapping {}/{} has no canonical_table",
                source_system, source_table
            )));
        }

        let fields = doc
            .fields
            .into_iter()
            .map(|(canonical, source)| {
                check_canonical_field(source_system, source_table, &canonical)?;
                let path = source.parse::<FieldPath>().map_err(|e| {
                    IngestError::Config(format!(
                        "mapping {}/{} field '{}': {}",
                        source_system, source_table, canonical, e
                    ))
                })?;
                Ok((canonical, path))
            })
            .collect::<Result<Vec<_>>>()?;

        if !fields.iter().any(|(name, _)| name == "id") {
            return Err(IngestError::Config(format!(
                "mapping {}/{} does not map 'id'",
                source_system, source_table
            )));
        }

        let scd_type = ScdType::from_config(doc.scd_type.as_deref(), &doc.canonical_table);

        Ok(Self {
            source_system: source_system.to_string(),
            source_table: source_table.to_string(),
            canonical_table: doc.canonical_table.clone(),
            scd: TableScdConfig {
                canonical_table: doc.canonical_table,
                scd_type,
            },
            fields,
        })
    }

    pub fn scd_type(&self) -> ScdType {
        self.scd.scd_type
    }
}

/// Canonical field names become column names in both the canonical file and
/// the target table, so they must be plain identifiers owned by no pipeline column.
fn check_canonical_field(source_system: &str, source_table: &str, name: &str) -> Result<()> {
    validate_identifier(name).map_err(|_| {
        IngestError::Config(format!(
            "mapping {}/{} field '{}' is not a valid column name",
            source_system, source_table, name
        ))
    })?;
    if RESERVED_COLUMNS.contains(&name) || TARGET_METADATA_COLUMNS.contains(&name) {
        return Err(IngestError::Config(format!(
            "mapping {}/{} maps reserved column '{}'",
            source_system, source_table, name
        )));
    }
    Ok(())
}

/// Where mapping documents come from
#[async_trait]
pub trait MappingLoader: Send + Sync {
    async fn load(&self, source_system: &str, source_table: &str)
        -> Result<Option<MappingDocument>>;
}

/// Reads `{dir}/{source_system}/{source_table}.json`
pub struct FileMappingLoader {
    dir: PathBuf,
}

impl FileMappingLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MappingLoader for FileMappingLoader {
    async fn load(
        &self,
        source_system: &str,
        source_table: &str,
    ) -> Result<Option<MappingDocument>> {
        // Both names become path segments
        validate_identifier(source_system)?;
        validate_identifier(source_table)?;

        let path = self
            .dir
            .join(source_system.to_lowercase())
            .join(format!("{}.json", source_table.to_lowercase()));

        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                IngestError::Config(format!("mapping {} is malformed: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Mapping documents held in memory, keyed by (source system, source table)
#[derive(Default)]
pub struct StaticMappingLoader {
    documents: HashMap<(String, String), serde_json::Value>,
}

impl StaticMappingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source_system: &str, source_table: &str, doc: serde_json::Value) -> Self {
        self.documents
            .insert((source_system.to_lowercase(), source_table.to_lowercase()), doc);
        self
    }
}

#[async_trait]
impl MappingLoader for StaticMappingLoader {
    async fn load(
        &self,
        source_system: &str,
        source_table: &str,
    ) -> Result<Option<MappingDocument>> {
        let key = (source_system.to_lowercase(), source_table.to_lowercase());
        match self.documents.get(&key) {
            Some(doc) => Ok(Some(serde_json::from_value(doc.clone())?)),
            None => Ok(None),
        }
    }
}

/// Bounded cache of validated mappings
pub struct MappingRegistry {
    loader: Box<dyn MappingLoader>,
    cache: Mutex<LruCache<(String, String), Arc<TableMapping>>>,
}

impl MappingRegistry {
    pub fn new(loader: Box<dyn MappingLoader>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, key: &(String, String)) -> Result<Option<Arc<TableMapping>>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| IngestError::Internal("mapping cache lock poisoned".into()))?;
        Ok(cache.get(key).cloned())
    }

    /// Mapping for a source table. A missing mapping is a configuration error.
    pub async fn get(&self, source_system: &str, source_table: &str) -> Result<Arc<TableMapping>> {
        let key = (source_system.to_lowercase(), source_table.to_lowercase());
        if let Some(mapping) = self.cached(&key)? {
            return Ok(mapping);
        }

        let doc = self.loader.load(source_system, source_table).await?.ok_or_else(|| {
            IngestError::Config(format!(
                "no field mapping for table '{}' from source '{}'",
                source_table, source_system
            ))
        })?;

        let mapping = Arc::new(TableMapping::from_document(source_system, source_table, doc)?);
        debug!(
            source_system,
            source_table,
            canonical_table = %mapping.canonical_table,
            scd_type = %mapping.scd_type(),
            "Loaded field mapping"
        );

        self.cache
            .lock()
            .map_err(|_| IngestError::Internal("mapping cache lock poisoned".into()))?
            .put(key, mapping.clone());

        Ok(mapping)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loader() -> StaticMappingLoader {
        StaticMappingLoader::new()
            .with(
                "connectwise",
                "company",
                json!({
                    "canonical_table": "companies",
                    "scd_type": "type_2",
                    "fields": { "id": "id", "name": "companyName" }
                }),
            )
            .with(
                "connectwise",
                "ticket",
                json!({
                    "canonical_table": "tickets",
                    "scd_type": "sometimes",
                    "fields": { "id": "id", "summary": "summary" }
                }),
            )
            .with("connectwise", "agreement", json!({ "canonical_table": "agreements", "fields": { "id": "id" } }))
    }

    #[test]
    fn test_scd_type_defaults() {
        assert_eq!(ScdType::from_config(None, "t"), ScdType::Type1);
        assert_eq!(ScdType::from_config(Some("TYPE_2"), "t"), ScdType::Type2);
        assert_eq!(ScdType::from_config(Some("scd2-please"), "t"), ScdType::Type1);
    }

    #[tokio::test]
    async fn test_registry_loads_and_caches() {
        let registry = MappingRegistry::new(Box::new(loader()), 2);

        let companies = registry.get("connectwise", "Company").await.unwrap();
        assert_eq!(companies.canonical_table, "companies");
        assert_eq!(companies.scd_type(), ScdType::Type2);

        let tickets = registry.get("connectwise", "ticket").await.unwrap();
        assert_eq!(tickets.scd_type(), ScdType::Type1);

        let agreements = registry.get("connectwise", "agreement").await.unwrap();
        assert_eq!(agreements.scd_type(), ScdType::Type1);
        assert_eq!(registry.cached_len(), 2);
    }

    #[tokio::test]
    async fn test_missing_mapping_is_config_error() {
        let registry = MappingRegistry::new(Box::new(loader()), 8);
        let err = registry.get("connectwise", "invoice").await.unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_mapping_without_id_is_rejected() {
        let doc: MappingDocument = serde_json::from_value(json!({
            "canonical_table": "companies",
            "fields": { "name": "companyName" }
        }))
        .unwrap();
        assert!(TableMapping::from_document("cw", "company", doc).is_err());
    }

    #[test]
    fn test_pipeline_columns_cannot_be_mapped() {
        for reserved in ["last_updated", "data_hash", "effective_date", "record_hash", "tenant_id", "is_current"] {
            let doc: MappingDocument = serde_json::from_value(json!({
                "canonical_table": "companies",
                "fields": { "id": "id", reserved: "lastUpdated" }
            }))
            .unwrap();
            let err = TableMapping::from_document("cw", "company", doc).unwrap_err();
            assert!(err.is_config(), "{} was accepted", reserved);
        }
    }

    #[test]
    fn test_field_names_must_be_identifiers() {
        let doc: MappingDocument = serde_json::from_value(json!({
            "canonical_table": "companies",
            "fields": { "id": "id", "name`; DROP": "name" }
        }))
        .unwrap();
        assert!(TableMapping::from_document("cw", "company", doc).unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_file_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("connectwise")).unwrap();
        std::fs::write(
            dir.path().join("connectwise").join("company.json"),
            r#"{ "canonical_table": "companies", "fields": { "id": "id", "name": "name" } }"#,
        )
        .unwrap();

        let loader = FileMappingLoader::new(dir.path());
        assert!(loader.load("connectwise", "company").await.unwrap().is_some());
        assert!(loader.load("connectwise", "ticket").await.unwrap().is_none());

        let err = loader.load("connectwise", "../../etc/passwd").await.unwrap_err();
        assert!(err.is_config());
        assert!(loader.load("..", "company").await.unwrap_err().is_config());
    }
}
