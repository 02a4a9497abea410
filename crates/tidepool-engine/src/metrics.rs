//! Observational metrics
//!
//! Metric emission never decides an outcome: [`emit_observational`] logs a
//! sink failure and carries on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub dimensions: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn emit(&self, metric: Metric) -> Result<()>;
}

/// Emits metrics as structured log events under the `tidepool::metrics` target
#[derive(Debug, Default)]
pub struct TracingMetrics;

#[async_trait]
impl MetricsSink for TracingMetrics {
    async fn emit(&self, metric: Metric) -> Result<()> {
        let dimensions = serde_json::to_string(&metric.dimensions)?;
        info!(
            target: "tidepool::metrics",
            metric = %metric.name,
            value = metric.value,
            dimensions = %dimensions,
            "metric"
        );
        Ok(())
    }
}

/// Collects metrics in memory; can be told to fail every emit
#[derive(Default)]
pub struct MemoryMetrics {
    emitted: Mutex<Vec<Metric>>,
    failing: bool,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn emitted(&self) -> Vec<Metric> {
        self.emitted.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetrics {
    async fn emit(&self, metric: Metric) -> Result<()> {
        if self.failing {
            return Err(IngestError::Transient("metrics endpoint unavailable".into()));
        }
        self.emitted
            .lock()
            .map_err(|_| IngestError::Internal("metrics lock poisoned".into()))?
            .push(metric);
        Ok(())
    }
}

/// Emit each metric, logging and swallowing any failure
pub async fn emit_observational(sink: &dyn MetricsSink, metrics: Vec<Metric>) {
    for metric in metrics {
        let name = metric.name.clone();
        if let Err(e) = sink.emit(metric).await {
            warn!(metric = %name, error = %e, "Failed to emit metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let sink = MemoryMetrics::failing();
        emit_observational(&sink, vec![Metric::new("records_fetched", 10.0)]).await;
        assert!(sink.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_dimensions_are_kept() {
        let sink = MemoryMetrics::new();
        emit_observational(
            &sink,
            vec![Metric::new("chunks_failed", 1.0).with("tenant_id", "acme").with("table", "tickets")],
        )
        .await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].dimensions["tenant_id"], "acme");
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_metrics() {
        TracingMetrics.emit(Metric::new("files_merged", 3.0)).await.unwrap();
    }
}
