//! Canonical Parquet files
//!
//! Column order: `tenant_id`, `id`, business fields (sorted), pipeline
//! metadata, then the SCD Type 2 columns when the table is versioned. Every
//! value column is Utf8 except `is_current`.

use arrow::array::{Array as _, ArrayRef, BooleanArray, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::record::{
    CanonicalRecord, VersionColumns, CANONICAL_TABLE, EFFECTIVE_END_DATE, EFFECTIVE_START_DATE,
    ID, INGESTION_TIMESTAMP, IS_CURRENT, RECORD_HASH, RESERVED_COLUMNS, SOURCE_SYSTEM,
    SOURCE_TABLE, TENANT_ID,
};
use crate::error::{IngestError, Result};
use crate::mapping::{ScdType, TableMapping};

const METADATA_COLUMNS: &[&str] =
    &[SOURCE_SYSTEM, SOURCE_TABLE, CANONICAL_TABLE, INGESTION_TIMESTAMP, RECORD_HASH];

/// Arrow schema of a mapping's canonical file
pub fn canonical_schema(mapping: &TableMapping) -> Result<Arc<Schema>> {
    let mut fields = vec![
        Field::new(TENANT_ID, DataType::Utf8, false),
        Field::new(ID, DataType::Utf8, false),
    ];

    for (name, _) in &mapping.fields {
        if name == ID {
            continue;
        }
        if RESERVED_COLUMNS.contains(&name.as_str()) {
            return Err(IngestError::Config(format!(
                "mapping {}/{} maps reserved column '{}'",
                mapping.source_system, mapping.source_table, name
            )));
        }
        fields.push(Field::new(name.as_str(), DataType::Utf8, true));
    }

    fields.extend(METADATA_COLUMNS.iter().map(|c| Field::new(*c, DataType::Utf8, false)));

    if mapping.scd_type() == ScdType::Type2 {
        fields.push(Field::new(EFFECTIVE_START_DATE, DataType::Utf8, false));
        fields.push(Field::new(EFFECTIVE_END_DATE, DataType::Utf8, true));
        fields.push(Field::new(IS_CURRENT, DataType::Boolean, false));
    }

    Ok(Arc::new(Schema::new(fields)))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by("tidepool".to_string())
        .build()
}

fn strings<F>(records: &[CanonicalRecord], f: F) -> ArrayRef
where
    F: Fn(&CanonicalRecord) -> String,
{
    Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn optional_strings<F>(records: &[CanonicalRecord], f: F) -> ArrayRef
where
    F: Fn(&CanonicalRecord) -> Option<String>,
{
    Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
}

/// Encode one file's records. Zero records still produce a valid file.
pub fn encode(mapping: &TableMapping, records: &[CanonicalRecord]) -> Result<Bytes> {
    let schema = canonical_schema(mapping)?;

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let name = field.name().as_str();
        let column = match name {
            TENANT_ID => strings(records, |r| r.tenant_id.clone()),
            ID => strings(records, |r| r.id().unwrap_or_default().to_string()),
            SOURCE_SYSTEM => strings(records, |r| r.source_system.clone()),
            SOURCE_TABLE => strings(records, |r| r.source_table.clone()),
            CANONICAL_TABLE => strings(records, |r| r.canonical_table.clone()),
            INGESTION_TIMESTAMP => strings(records, |r| r.ingestion_timestamp.clone()),
            RECORD_HASH => strings(records, |r| r.record_hash.clone()),
            EFFECTIVE_START_DATE => strings(records, |r| {
                r.versioning
                    .as_ref()
                    .map(|v| v.effective_start_date.clone())
                    .unwrap_or_else(|| r.ingestion_timestamp.clone())
            }),
            EFFECTIVE_END_DATE => optional_strings(records, |r| {
                r.versioning.as_ref().and_then(|v| v.effective_end_date.clone())
            }),
            IS_CURRENT => Arc::new(BooleanArray::from(
                records
                    .iter()
                    .map(|r| r.versioning.as_ref().map(|v| v.is_current).unwrap_or(true))
                    .collect::<Vec<_>>(),
            )),
            business => optional_strings(records, |r| r.fields.get(business).cloned().flatten()),
        };
        columns.push(column);
    }

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema.clone(), Some(writer_properties()))?;
    if !records.is_empty() {
        let batch = RecordBatch::try_new(schema, columns)?;
        writer.write(&batch)?;
    }
    writer.close()?;

    Ok(Bytes::from(buf))
}

fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| IngestError::Parquet(format!("missing column '{}': {}", name, e)))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| IngestError::Parquet(format!("column '{}' is not Utf8", name)))
}

fn col_string_opt<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    let idx = batch.schema().index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<StringArray>()
}

fn col_bool_opt<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a BooleanArray> {
    let idx = batch.schema().index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<BooleanArray>()
}

fn value_at(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

/// Decode a canonical file. Columns not reserved for metadata are business fields.
pub fn decode(data: Bytes) -> Result<Vec<CanonicalRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let schema = batch.schema();

        let tenant = col_string(&batch, TENANT_ID)?;
        let source_system = col_string(&batch, SOURCE_SYSTEM)?;
        let source_table = col_string(&batch, SOURCE_TABLE)?;
        let canonical_table = col_string(&batch, CANONICAL_TABLE)?;
        let ingested = col_string(&batch, INGESTION_TIMESTAMP)?;
        let hash = col_string(&batch, RECORD_HASH)?;
        col_string(&batch, ID)?;

        let business: Vec<(&str, &StringArray)> = schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .filter(|name| !RESERVED_COLUMNS.contains(name))
            .map(|name| col_string(&batch, name).map(|col| (name, col)))
            .collect::<Result<_>>()?;

        let start = col_string_opt(&batch, EFFECTIVE_START_DATE);
        let end = col_string_opt(&batch, EFFECTIVE_END_DATE);
        let current = col_bool_opt(&batch, IS_CURRENT);

        for row in 0..batch.num_rows() {
            let fields: BTreeMap<String, Option<String>> = business
                .iter()
                .map(|(name, col)| (name.to_string(), value_at(col, row)))
                .collect();

            let versioning = start.map(|start| VersionColumns {
                effective_start_date: start.value(row).to_string(),
                effective_end_date: end.and_then(|c| value_at(c, row)),
                is_current: current.map(|c| c.value(row)).unwrap_or(true),
            });

            records.push(CanonicalRecord {
                tenant_id: tenant.value(row).to_string(),
                source_system: source_system.value(row).to_string(),
                source_table: source_table.value(row).to_string(),
                canonical_table: canonical_table.value(row).to_string(),
                ingestion_timestamp: ingested.value(row).to_string(),
                record_hash: hash.value(row).to_string(),
                fields,
                versioning,
            });
        }
    }

    Ok(records)
}
