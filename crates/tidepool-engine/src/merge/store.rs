//! Analytical store interface
//!
//! Operations are expressed at the level of merge steps so the Type 1 and
//! Type 2 disciplines read the same against any backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{IngestError, Result};
use crate::mapping::ScdType;

/// How staged rows reach the target table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Every staged row (Type 1, after matching rows were deleted)
    All,
    /// Staged rows without an identical current row, versioned after the
    /// highest existing version of their key (Type 2)
    MissingOrChanged,
}

/// One row of a target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub tenant_id: String,
    pub id: String,
    /// Business fields other than `id`
    pub fields: BTreeMap<String, Option<String>>,
    pub source_system: String,
    pub source_id: String,
    pub last_updated: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub data_hash: String,
    pub record_version: u64,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub is_current: bool,
}

/// Columns every target row carries besides `tenant_id`, `id` and business fields
pub const TARGET_METADATA_COLUMNS: &[&str] = &[
    "source_system",
    "source_id",
    "last_updated",
    "created_date",
    "data_hash",
    "record_version",
    "effective_date",
    "expiration_date",
    "is_current",
];

/// DateTime64(6) text form
pub fn format_datetime(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

impl TargetRow {
    /// Flat JSON object in target column names
    pub fn to_json(&self, scd_type: ScdType) -> Value {
        let mut row = Map::new();
        row.insert("tenant_id".into(), Value::String(self.tenant_id.clone()));
        row.insert("id".into(), Value::String(self.id.clone()));
        for (name, value) in &self.fields {
            row.insert(
                name.clone(),
                value.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        row.insert("source_system".into(), Value::String(self.source_system.clone()));
        row.insert("source_id".into(), Value::String(self.source_id.clone()));
        row.insert("last_updated".into(), Value::String(format_datetime(self.last_updated)));
        row.insert("created_date".into(), Value::String(format_datetime(self.created_date)));
        row.insert("data_hash".into(), Value::String(self.data_hash.clone()));
        row.insert("record_version".into(), Value::from(self.record_version));

        if scd_type == ScdType::Type2 {
            let effective = self.effective_date.unwrap_or(self.last_updated);
            row.insert("effective_date".into(), Value::String(format_datetime(effective)));
            row.insert(
                "expiration_date".into(),
                self.expiration_date
                    .map(|ts| Value::String(format_datetime(ts)))
                    .unwrap_or(Value::Null),
            );
            row.insert("is_current".into(), Value::from(u8::from(self.is_current)));
        }

        Value::Object(row)
    }
}

/// Table and column names are interpolated into SQL, so only
/// `[A-Za-z0-9_]` is accepted
pub fn validate_identifier(name: &str) -> Result<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(IngestError::Config(format!("invalid identifier '{}'", name)))
    }
}

#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    /// Create the target table if needed and add any missing business columns
    async fn ensure_target_table(
        &self,
        table: &str,
        business_columns: &[String],
        scd_type: ScdType,
    ) -> Result<()>;

    /// Empty staging table shaped like `table`
    async fn create_staging(&self, staging: &str, table: &str) -> Result<()>;

    async fn load_staging(&self, staging: &str, rows: &[TargetRow], scd_type: ScdType)
        -> Result<()>;

    /// Delete target rows of `tenant_id` whose id is staged
    async fn delete_matching(&self, table: &str, staging: &str, tenant_id: &str) -> Result<()>;

    /// Close current rows whose id is staged with a different hash
    async fn expire_changed(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the number of rows inserted, when the backend reports it
    async fn insert_staged(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        mode: InsertMode,
    ) -> Result<Option<u64>>;

    async fn drop_staging(&self, staging: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("time_entries").is_ok());
        assert!(validate_identifier("companies_staging_3f2a").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("a.b").is_err());
    }

    #[test]
    fn test_row_json_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().unwrap();
        let row = TargetRow {
            tenant_id: "acme".into(),
            id: "7".into(),
            fields: BTreeMap::from([("name".to_string(), Some("Acme".to_string())), ("city".to_string(), None)]),
            source_system: "connectwise".into(),
            source_id: "7".into(),
            last_updated: ts,
            created_date: ts,
            data_hash: "abc".into(),
            record_version: 2,
            effective_date: Some(ts),
            expiration_date: None,
            is_current: true,
        };

        let type1 = row.to_json(ScdType::Type1);
        assert!(type1.get("is_current").is_none());
        assert_eq!(type1["city"], Value::Null);

        let type2 = row.to_json(ScdType::Type2);
        assert_eq!(type2["effective_date"], "2024-01-02 03:04:05.000000");
        assert_eq!(type2["is_current"], 1);
        assert_eq!(type2["record_version"], 2);
    }
}
