use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{PageRequest, SourceApi};
use crate::error::{IngestError, Result};
use crate::state::DateWindow;
use crate::tenant::TenantCredentials;

/// Source serving fixed record sets.
///
/// With a window, only records whose `updated_at` falls inside it are served.
/// Offsets registered through [`MemorySource::fail_at`] return a permanent
/// source error.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failing_offsets: Mutex<HashSet<u64>>,
    countable: bool,
    page_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            countable: true,
            ..Self::default()
        }
    }

    /// Source that answers `count` with `None`
    pub fn uncountable() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, records: Vec<Value>) -> Self {
        self.set_table(table, records);
        self
    }

    /// Replace what a table serves from now on
    pub fn set_table(&self, table: &str, records: Vec<Value>) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(table.to_lowercase(), records);
        }
    }

    pub fn fail_at(&self, offset: u64) {
        if let Ok(mut failing) = self.failing_offsets.lock() {
            failing.insert(offset);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_offsets.lock() {
            failing.clear();
        }
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn records(&self, table: &str, window: Option<&DateWindow>) -> Result<Vec<Value>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| IngestError::Internal("source lock poisoned".into()))?;
        let records = tables.get(&table.to_lowercase()).cloned().unwrap_or_default();

        Ok(match window {
            None => records,
            Some(w) => records.into_iter().filter(|r| in_window(r, w)).collect(),
        })
    }
}

fn in_window(record: &Value, window: &DateWindow) -> bool {
    record
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| {
            let ts = ts.with_timezone(&Utc);
            ts >= window.start && ts < window.end
        })
        .unwrap_or(false)
}

#[async_trait]
impl SourceApi for MemorySource {
    async fn count(
        &self,
        _creds: &TenantCredentials,
        table: &str,
        window: Option<&DateWindow>,
    ) -> Result<Option<u64>> {
        if !self.countable {
            return Ok(None);
        }
        Ok(Some(self.records(table, window)?.len() as u64))
    }

    async fn fetch_page(
        &self,
        _creds: &TenantCredentials,
        request: &PageRequest,
    ) -> Result<Vec<Value>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_offsets
            .lock()
            .map_err(|_| IngestError::Internal("source lock poisoned".into()))?
            .contains(&request.offset);
        if failing {
            return Err(IngestError::Source(format!(
                "injected failure at offset {}",
                request.offset
            )));
        }

        let records = self.records(&request.table, request.window.as_ref())?;
        Ok(records
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .collect())
    }
}
