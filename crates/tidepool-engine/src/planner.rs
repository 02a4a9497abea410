//! Chunk planning
//!
//! Master data (reference tables) is fetched whole, split into offset chunks.
//! Everything else is transactional and gets one chunk per date window.
//! The job and every chunk record are persisted before anything is dispatched.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::{IngestError, Result};
use crate::source::SourceApi;
use crate::state::{ChunkProgress, ChunkStatus, DateWindow, JobStatus, ProcessingJob, StateStore};
use crate::tenant::{TenantCredentials, TenantResolver};

/// Reference tables fetched without a date filter
pub const MASTER_TABLES: &[&str] = &[
    "companies",
    "contacts",
    "users",
    "accounts",
    "resources",
    "products",
    "configurations",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableClass {
    Master,
    Transactional,
}

/// Unknown tables are transactional, so nothing unrecognised is fetched unbounded
pub fn classify(table: &str) -> TableClass {
    if MASTER_TABLES.iter().any(|m| m.eq_ignore_ascii_case(table)) {
        TableClass::Master
    } else {
        TableClass::Transactional
    }
}

/// `YYYY-MM-DD` (midnight UTC) or RFC 3339
pub fn parse_date(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            IngestError::Config(format!(
                "unparsable date '{}': expected YYYY-MM-DD or RFC 3339",
                input
            ))
        })
}

/// Resolve optional start/end input into a range.
///
/// End defaults to the start of today (UTC), start to `lookback_days` before end.
pub fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
    lookback_days: u32,
) -> Result<DateWindow> {
    let end = match end {
        Some(s) => parse_date(s)?,
        None => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
    };
    let start = match start {
        Some(s) => parse_date(s)?,
        None => end
            .checked_sub_signed(Duration::days(i64::from(lookback_days)))
            .ok_or_else(|| {
                IngestError::Config(format!("lookback of {} days is out of range", lookback_days))
            })?,
    };

    if start >= end {
        return Err(IngestError::Config(format!(
            "start date {} is not before end date {}",
            start, end
        )));
    }

    Ok(DateWindow { start, end })
}

/// Contiguous windows exactly tiling `[start, end)`; the last one ends at `end`
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk_size_days: u32,
) -> Result<Vec<DateWindow>> {
    if chunk_size_days == 0 {
        return Err(IngestError::Config("chunk_size_days must be greater than 0".into()));
    }
    if start >= end {
        return Err(IngestError::Config(format!(
            "start date {} is not before end date {}",
            start, end
        )));
    }

    let step = Duration::days(i64::from(chunk_size_days));
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor.checked_add_signed(step).map_or(end, |n| n.min(end));
        windows.push(DateWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }

    Ok(windows)
}

/// `[start, end)` offset ranges of at most `batch` records covering `total`
pub fn plan_offsets(total: u64, batch: u64) -> Vec<(u64, u64)> {
    if total == 0 || batch == 0 {
        return vec![(0, total)];
    }
    (0..total.div_ceil(batch))
        .map(|i| (i * batch, ((i + 1) * batch).min(total)))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub tenant_id: String,
    pub service: String,
    pub table_name: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub chunk_size_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub job: ProcessingJob,
    pub classification: TableClass,
    pub chunks: Vec<ChunkProgress>,
}

pub struct ChunkPlanner {
    state: Arc<dyn StateStore>,
    source: Arc<dyn SourceApi>,
    resolver: Arc<TenantResolver>,
    config: ChunkingConfig,
}

impl ChunkPlanner {
    pub fn new(
        state: Arc<dyn StateStore>,
        source: Arc<dyn SourceApi>,
        resolver: Arc<TenantResolver>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            state,
            source,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Plan one table, resolving dates from the request
    pub async fn plan(&self, request: &PlanRequest) -> Result<ChunkPlan> {
        let range = resolve_range(
            request.start_date.as_deref(),
            request.end_date.as_deref(),
            Utc::now(),
            self.config.lookback_days,
        )?;
        let days = request.chunk_size_days.unwrap_or(self.config.chunk_size_days);

        self.plan_range(&request.tenant_id, &request.service, &request.table_name, range, days)
            .await
    }

    /// Plan one table over an already-resolved range
    #[instrument(skip(self, range), fields(start = %range.start, end = %range.end))]
    pub async fn plan_range(
        &self,
        tenant_id: &str,
        service: &str,
        table_name: &str,
        range: DateWindow,
        chunk_size_days: u32,
    ) -> Result<ChunkPlan> {
        let classification = classify(table_name);

        // Validate the range before touching anything remote
        let windows = match classification {
            TableClass::Transactional => plan_windows(range.start, range.end, chunk_size_days)?,
            TableClass::Master => Vec::new(),
        };

        let creds = self.resolver.resolve(tenant_id, service).await?;
        creds.ensure_endpoint_enabled(table_name)?;

        let now = Utc::now();
        let job = ProcessingJob {
            job_id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            service: service.to_string(),
            table_name: table_name.to_string(),
            status: JobStatus::Running,
            created_at: now,
            completed_at: None,
            total_records: 0,
            errors: Vec::new(),
        };

        let slices = match classification {
            TableClass::Master => self.master_slices(&creds, table_name).await?,
            TableClass::Transactional => self.window_slices(&creds, table_name, windows).await?,
        };

        let chunks: Vec<ChunkProgress> = slices
            .into_iter()
            .enumerate()
            .map(|(i, slice)| ChunkProgress {
                job_id: job.job_id,
                chunk_id: i as u32,
                tenant_id: tenant_id.to_string(),
                service: service.to_string(),
                table_name: table_name.to_string(),
                window: slice.window,
                start_offset: slice.start_offset,
                end_offset: slice.end_offset,
                open_ended: slice.open_ended,
                estimated_records: slice.end_offset - slice.start_offset,
                records_processed: 0,
                status: ChunkStatus::Processing,
                continuation: None,
                output_files: Vec::new(),
                invocations: 0,
                last_error: None,
                updated_at: now,
            })
            .collect();

        self.state.put_job(&job).await?;
        self.state.put_chunks(&chunks).await?;

        info!(
            tenant_id,
            table = table_name,
            job_id = %job.job_id,
            classification = ?classification,
            chunks = chunks.len(),
            "Planned ingestion job"
        );

        Ok(ChunkPlan {
            job,
            classification,
            chunks,
        })
    }

    async fn master_slices(&self, creds: &TenantCredentials, table: &str) -> Result<Vec<Slice>> {
        let slices = match self.source.count(creds, table, None).await? {
            Some(total) => plan_offsets(total, self.config.master_chunk_records)
                .into_iter()
                .map(|(start, end)| Slice::counted(None, start, end))
                .collect(),
            None => vec![Slice::uncounted(None, self.config.max_records_per_chunk)],
        };
        Ok(slices)
    }

    async fn window_slices(
        &self,
        creds: &TenantCredentials,
        table: &str,
        windows: Vec<DateWindow>,
    ) -> Result<Vec<Slice>> {
        let mut slices = Vec::with_capacity(windows.len());
        for window in windows {
            let slice = match self.source.count(creds, table, Some(&window)).await? {
                Some(total) => Slice::counted(Some(window), 0, total),
                None => Slice::uncounted(Some(window), self.config.max_records_per_chunk),
            };
            slices.push(slice);
        }
        Ok(slices)
    }
}

/// Offset range of one planned chunk
struct Slice {
    window: Option<DateWindow>,
    start_offset: u64,
    end_offset: u64,
    open_ended: bool,
}

impl Slice {
    fn counted(window: Option<DateWindow>, start_offset: u64, end_offset: u64) -> Self {
        Self {
            window,
            start_offset,
            end_offset,
            open_ended: false,
        }
    }

    /// The source cannot count: cap the first pass, the processor extends it
    fn uncounted(window: Option<DateWindow>, cap: u64) -> Self {
        Self {
            window,
            start_offset: 0,
            end_offset: cap,
            open_ended: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify("Companies"), TableClass::Master);
        assert_eq!(classify("tickets"), TableClass::Transactional);
        assert_eq!(classify("something_new"), TableClass::Transactional);
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2024-02-29").unwrap(), day(2024, 2, 29));
        assert_eq!(parse_date("2024-02-29T12:00:00+02:00").unwrap().to_rfc3339(), "2024-02-29T10:00:00+00:00");
        assert!(parse_date("29/02/2024").unwrap_err().is_config());
        assert!(parse_date("2023-02-29").is_err());
    }

    #[test]
    fn test_default_range_is_two_years() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 0).single().unwrap();
        let range = resolve_range(None, None, now, 730).unwrap();
        assert_eq!(range.end, day(2024, 6, 15));
        assert_eq!(range.end - range.start, Duration::days(730));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let now = Utc::now();
        let err = resolve_range(Some("2024-03-01"), Some("2024-01-01"), now, 730).unwrap_err();
        assert!(err.is_config());
        assert!(resolve_range(Some("2024-03-01"), Some("2024-03-01"), now, 730).is_err());
    }

    #[test]
    fn test_windows_last_one_is_short() {
        let windows = plan_windows(day(2024, 1, 1), day(2024, 3, 1), 30).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].end, day(2024, 1, 31));
        assert_eq!(windows[1].start, day(2024, 1, 31));
        assert_eq!(windows[1].end, day(2024, 3, 1));
    }

    #[test]
    fn test_huge_chunk_size_gives_one_window() {
        let windows = plan_windows(day(2024, 1, 1), day(2024, 3, 1), 100_000_000).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, day(2024, 1, 1));
        assert_eq!(windows[0].end, day(2024, 3, 1));

        let windows = plan_windows(day(2024, 1, 1), day(2024, 3, 1), u32::MAX).unwrap();
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_out_of_range_lookback_is_a_config_error() {
        let err = resolve_range(None, Some("2024-03-01"), Utc::now(), u32::MAX).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_zero_day_chunks_rejected() {
        assert!(plan_windows(day(2024, 1, 1), day(2024, 2, 1), 0).is_err());
    }

    #[test]
    fn test_offsets() {
        assert_eq!(plan_offsets(12_000, 5_000), vec![(0, 5_000), (5_000, 10_000), (10_000, 12_000)]);
        assert_eq!(plan_offsets(5_000, 5_000), vec![(0, 5_000)]);
        assert_eq!(plan_offsets(0, 5_000), vec![(0, 0)]);
    }

    proptest! {
        #[test]
        fn prop_windows_tile_range(
            start_day in 0i64..20_000,
            span_days in 1i64..2_000,
            extra_secs in 0i64..86_400,
            chunk_days in 1u32..120,
        ) {
            let start = DateTime::UNIX_EPOCH + Duration::days(start_day);
            let end = start + Duration::days(span_days) + Duration::seconds(extra_secs);
            let windows = plan_windows(start, end, chunk_days).unwrap();

            prop_assert_eq!(windows[0].start, start);
            prop_assert_eq!(windows[windows.len() - 1].end, end);
            for pair in windows.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for w in &windows {
                prop_assert!(w.start < w.end);
                prop_assert!(w.end - w.start <= Duration::days(i64::from(chunk_days)));
            }
        }

        #[test]
        fn prop_offsets_cover_total(total in 1u64..1_000_000, batch in 1u64..50_000) {
            let ranges = plan_offsets(total, batch);
            prop_assert_eq!(ranges[0].0, 0);
            prop_assert_eq!(ranges[ranges.len() - 1].1, total);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].1, pair[1].0);
            }
        }
    }
}
