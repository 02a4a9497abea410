//! Source record -> canonical record
//!
//! Business values are stored as text cells: strings stay as they are,
//! everything else becomes its JSON text. Hashing the cell form means the hash
//! recomputed from a canonical Parquet file matches the one computed here.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tidepool_common::hashing::record_hash;

use crate::mapping::{ScdType, TableMapping};

pub const TENANT_ID: &str = "tenant_id";
pub const ID: &str = "id";
pub const SOURCE_SYSTEM: &str = "source_system";
pub const SOURCE_TABLE: &str = "source_table";
pub const CANONICAL_TABLE: &str = "canonical_table";
pub const INGESTION_TIMESTAMP: &str = "ingestion_timestamp";
pub const RECORD_HASH: &str = "record_hash";
pub const EFFECTIVE_START_DATE: &str = "effective_start_date";
pub const EFFECTIVE_END_DATE: &str = "effective_end_date";
pub const IS_CURRENT: &str = "is_current";

/// Columns that are never business fields
pub const RESERVED_COLUMNS: &[&str] = &[
    TENANT_ID,
    SOURCE_SYSTEM,
    SOURCE_TABLE,
    CANONICAL_TABLE,
    INGESTION_TIMESTAMP,
    RECORD_HASH,
    EFFECTIVE_START_DATE,
    EFFECTIVE_END_DATE,
    IS_CURRENT,
];

/// Business fields a record must carry to be written at all
pub fn required_fields(canonical_table: &str) -> &'static [&'static str] {
    match canonical_table.to_ascii_lowercase().as_str() {
        "companies" => &["id", "name"],
        "contacts" => &["id", "first_name"],
        "tickets" => &["id", "summary"],
        "time_entries" => &["id", "hours"],
        "users" => &["id", "username"],
        _ => &["id"],
    }
}

pub fn is_id_field(field: &str) -> bool {
    field == ID || field.ends_with("_id")
}

/// Absent, null, or blank text
pub fn is_missing(cell: Option<&Option<String>>) -> bool {
    match cell {
        None | Some(None) => true,
        Some(Some(s)) => s.trim().is_empty(),
    }
}

/// Text form of a source value; `None` for null
pub fn to_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Id-like fields must end up as a string. Scalars already are after
/// [`to_cell`]; nested values are not valid ids.
fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(_) | Value::Array(_) => None,
        other => to_cell(other),
    }
}

/// Hash over the text cells of the business fields
pub fn hash_cells(fields: &BTreeMap<String, Option<String>>) -> String {
    let map: Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
        .collect();
    record_hash(&map)
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SCD Type 2 columns set at transform time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionColumns {
    pub effective_start_date: String,
    pub effective_end_date: Option<String>,
    pub is_current: bool,
}

/// One row of a canonical file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub tenant_id: String,
    pub source_system: String,
    pub source_table: String,
    pub canonical_table: String,
    pub ingestion_timestamp: String,
    pub record_hash: String,
    /// Business fields including `id`
    pub fields: BTreeMap<String, Option<String>>,
    pub versioning: Option<VersionColumns>,
}

impl CanonicalRecord {
    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID).and_then(|v| v.as_deref())
    }
}

/// Why a record did not make it into canonical output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub missing: Vec<String>,
}

/// Per-file constants for mapping records
pub struct RecordMapper<'a> {
    pub tenant_id: &'a str,
    pub source_system: &'a str,
    pub mapping: &'a TableMapping,
    pub ingested_at: DateTime<Utc>,
}

impl RecordMapper<'_> {
    /// Map one source record, or report which required fields were missing
    pub fn map(&self, source: &Value) -> Result<CanonicalRecord, Dropped> {
        let fields: BTreeMap<String, Option<String>> = self
            .mapping
            .fields
            .iter()
            .map(|(name, path)| {
                let cell = path.resolve(source).and_then(|v| {
                    if is_id_field(name) {
                        coerce_id(v)
                    } else {
                        to_cell(v)
                    }
                });
                (name.clone(), cell)
            })
            .collect();

        let missing: Vec<String> = required_fields(&self.mapping.canonical_table)
            .iter()
            .filter(|f| is_missing(fields.get(**f)))
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Dropped { missing });
        }

        let ingestion_timestamp = format_timestamp(self.ingested_at);
        let versioning = match self.mapping.scd_type() {
            ScdType::Type1 => None,
            ScdType::Type2 => Some(VersionColumns {
                effective_start_date: ingestion_timestamp.clone(),
                effective_end_date: None,
                is_current: true,
            }),
        };

        Ok(CanonicalRecord {
            tenant_id: self.tenant_id.to_string(),
            source_system: self.source_system.to_string(),
            source_table: self.mapping.source_table.clone(),
            canonical_table: self.mapping.canonical_table.clone(),
            ingestion_timestamp,
            record_hash: hash_cells(&fields),
            fields,
            versioning,
        })
    }
}
