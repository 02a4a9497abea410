use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::store::{AnalyticalStore, InsertMode, TargetRow};
use crate::error::{IngestError, Result};
use crate::mapping::ScdType;

#[derive(Debug, Clone)]
struct TargetTable {
    scd_type: ScdType,
    columns: BTreeSet<String>,
    rows: Vec<TargetRow>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, TargetTable>,
    staging: HashMap<String, Vec<TargetRow>>,
    failing_ids: HashSet<String>,
}

/// In-process analytical store with the same row semantics as the SQL backend
#[derive(Default)]
pub struct MemoryAnalyticalStore {
    inner: Mutex<Inner>,
}

impl MemoryAnalyticalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| IngestError::Internal("analytical store lock poisoned".into()))
    }

    /// Every row of a table, in insertion order
    pub fn rows(&self, table: &str) -> Vec<TargetRow> {
        self.lock()
            .ok()
            .and_then(|inner| inner.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|inner| inner.tables.get(table).map(|t| t.columns.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn staging_tables(&self) -> usize {
        self.lock().map(|inner| inner.staging.len()).unwrap_or(0)
    }

    /// Make any staging load containing `id` fail
    pub fn fail_loads_with_id(&self, id: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_ids.insert(id.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_ids.clear();
        }
    }
}

fn staged_ids(staged: &[TargetRow]) -> HashMap<&str, &str> {
    staged.iter().map(|r| (r.id.as_str(), r.data_hash.as_str())).collect()
}

#[async_trait]
impl AnalyticalStore for MemoryAnalyticalStore {
    async fn ensure_target_table(
        &self,
        table: &str,
        business_columns: &[String],
        scd_type: ScdType,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let target = inner.tables.entry(table.to_string()).or_insert_with(|| TargetTable {
            scd_type,
            columns: BTreeSet::new(),
            rows: Vec::new(),
        });
        if target.scd_type != scd_type {
            return Err(IngestError::Merge(format!(
                "table {} is {} but a {} merge was requested",
                table, target.scd_type, scd_type
            )));
        }
        target.columns.extend(business_columns.iter().cloned());
        Ok(())
    }

    async fn create_staging(&self, staging: &str, table: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.tables.contains_key(table) {
            return Err(IngestError::Merge(format!("target table {} does not exist", table)));
        }
        if inner.staging.insert(staging.to_string(), Vec::new()).is_some() {
            return Err(IngestError::Merge(format!("staging table {} already exists", staging)));
        }
        Ok(())
    }

    async fn load_staging(&self, staging: &str, rows: &[TargetRow], _scd_type: ScdType) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(bad) = rows.iter().find(|r| inner.failing_ids.contains(&r.id)) {
            return Err(IngestError::Merge(format!("rejected row with id {}", bad.id)));
        }
        inner
            .staging
            .get_mut(staging)
            .ok_or_else(|| IngestError::Merge(format!("no staging table {}", staging)))?
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn delete_matching(&self, table: &str, staging: &str, tenant_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner {
            tables, staging: stage, ..
        } = &mut *inner;
        let staged = stage
            .get(staging)
            .ok_or_else(|| IngestError::Merge(format!("no staging table {}", staging)))?;
        let ids = staged_ids(staged);
        let target = tables
            .get_mut(table)
            .ok_or_else(|| IngestError::Merge(format!("target table {} does not exist", table)))?;

        target
            .rows
            .retain(|row| !(row.tenant_id == tenant_id && ids.contains_key(row.id.as_str())));
        Ok(())
    }

    async fn expire_changed(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner {
            tables, staging: stage, ..
        } = &mut *inner;
        let staged = stage
            .get(staging)
            .ok_or_else(|| IngestError::Merge(format!("no staging table {}", staging)))?;
        let ids = staged_ids(staged);
        let target = tables
            .get_mut(table)
            .ok_or_else(|| IngestError::Merge(format!("target table {} does not exist", table)))?;

        for row in target.rows.iter_mut() {
            if row.tenant_id != tenant_id || !row.is_current {
                continue;
            }
            if let Some(hash) = ids.get(row.id.as_str()) {
                if *hash != row.data_hash {
                    row.is_current = false;
                    row.expiration_date = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn insert_staged(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        mode: InsertMode,
    ) -> Result<Option<u64>> {
        let mut inner = self.lock()?;
        let staged = inner
            .staging
            .get(staging)
            .cloned()
            .ok_or_else(|| IngestError::Merge(format!("no staging table {}", staging)))?;
        let target = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| IngestError::Merge(format!("target table {} does not exist", table)))?;

        let mut inserted = 0;
        for mut row in staged.into_iter().filter(|r| r.tenant_id == tenant_id) {
            if mode == InsertMode::MissingOrChanged {
                let same_key = |r: &&TargetRow| r.tenant_id == row.tenant_id && r.id == row.id;
                if target
                    .rows
                    .iter()
                    .filter(same_key)
                    .any(|r| r.is_current && r.data_hash == row.data_hash)
                {
                    continue;
                }
                row.record_version =
                    target.rows.iter().filter(same_key).map(|r| r.record_version).max().unwrap_or(0) + 1;
            }
            target.rows.push(row);
            inserted += 1;
        }

        Ok(Some(inserted))
    }

    async fn drop_staging(&self, staging: &str) -> Result<()> {
        self.lock()?.staging.remove(staging);
        Ok(())
    }
}
