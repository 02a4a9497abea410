//! Content hashing for canonical records and stored objects

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Fields that never contribute to a record's content hash.
///
/// Change-tracking columns and pipeline metadata vary between loads of the same
/// business content, so hashing them would make every reload look like a change.
pub const EXCLUDED_HASH_FIELDS: &[&str] = &[
    "effective_start_date",
    "effective_end_date",
    "is_current",
    "record_hash",
    "ingestion_timestamp",
    "tenant_id",
    "source_system",
    "source_table",
    "canonical_table",
];

/// Returns true when `field` participates in [`record_hash`]
pub fn is_business_field(field: &str) -> bool {
    !EXCLUDED_HASH_FIELDS.contains(&field)
}

/// SHA-256 of raw bytes, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash the business fields of a record.
///
/// Keys are sorted before serialization (nested objects included), so the
/// result does not depend on field order.
pub fn record_hash(fields: &Map<String, Value>) -> String {
    let business: BTreeMap<&str, Canonical<'_>> = fields
        .iter()
        .filter(|(k, _)| is_business_field(k))
        .map(|(k, v)| (k.as_str(), Canonical(v)))
        .collect();

    let mut buf = Vec::with_capacity(256);
    write_canonical(&mut buf, &business);
    sha256_hex(&buf)
}

struct Canonical<'a>(&'a Value);

fn write_canonical(buf: &mut Vec<u8>, map: &BTreeMap<&str, Canonical<'_>>) {
    buf.push(b'{');
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        write_string(buf, key);
        buf.push(b':');
        write_value(buf, value.0);
    }
    buf.push(b'}');
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Object(obj) => {
            let sorted: BTreeMap<&str, Canonical<'_>> =
                obj.iter().map(|(k, v)| (k.as_str(), Canonical(v))).collect();
            write_canonical(buf, &sorted);
        },
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(buf, item);
            }
            buf.push(b']');
        },
        Value::String(s) => write_string(buf, s),
        scalar => buf.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    // Value::to_string gives the JSON-escaped form
    buf.extend_from_slice(Value::String(s.to_string()).to_string().as_bytes());
}
