//! Object key layout
//!
//! `{tenant}/{stage}/{service}/{table}/{timestamp}/{file}.{ext}`. Canonical
//! objects put the canonical table in the service slot and the source table in
//! the table slot.

use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Raw,
    Canonical,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Canonical => "canonical",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp component used in keys. Microseconds keep two jobs or runs
/// started in the same second apart.
pub fn key_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// Prefix holding every raw object of one (tenant, service, table)
pub fn raw_prefix(tenant_id: &str, service: &str, table: &str) -> String {
    format!("{}/{}/{}/{}/", tenant_id, Stage::Raw, service, table)
}

/// One raw segment of a chunk. `from_offset` keeps continuation segments apart.
pub fn raw_segment_key(
    tenant_id: &str,
    service: &str,
    table: &str,
    job_created_at: DateTime<Utc>,
    chunk_id: u32,
    from_offset: u64,
) -> String {
    format!(
        "{}{}/chunk-{}-{:08}.jsonl",
        raw_prefix(tenant_id, service, table),
        key_timestamp(job_created_at),
        chunk_id,
        from_offset
    )
}

pub fn canonical_key(
    tenant_id: &str,
    canonical_table: &str,
    source_table: &str,
    run_at: DateTime<Utc>,
    ordinal: usize,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{:05}.parquet",
        tenant_id,
        Stage::Canonical,
        canonical_table,
        source_table,
        key_timestamp(run_at),
        ordinal
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).single().unwrap()
    }

    #[test]
    fn test_raw_segment_key() {
        let key = raw_segment_key("acme", "psa", "tickets", ts(), 3, 2000);
        assert_eq!(key, "acme/raw/psa/tickets/20240305T140709.000000Z/chunk-3-00002000.jsonl");
        assert!(key.starts_with(&raw_prefix("acme", "psa", "tickets")));
    }

    #[test]
    fn test_canonical_key() {
        let key = canonical_key("acme", "companies", "company", ts(), 12);
        assert_eq!(key, "acme/canonical/companies/company/20240305T140709.000000Z/00012.parquet");
    }
}
