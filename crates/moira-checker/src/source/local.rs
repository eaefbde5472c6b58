use super::{MetricSource, DEFAULT_STEP};
use crate::error::Result;
use crate::series::Series;
use crate::target::Target;
use async_trait::async_trait;
use moira_storage::DynDatabase;
use std::collections::HashMap;

/// Reads series from the retention store and applies target functions
/// in process.
pub struct LocalSource {
    db: DynDatabase,
    /// Points older than `until - metrics_ttl` are deleted after a fetch.
    /// Zero keeps everything.
    metrics_ttl: i64,
}

impl LocalSource {
    pub fn new(db: DynDatabase, metrics_ttl: i64) -> Self {
        Self { db, metrics_ttl }
    }

    async fn resolve(&self, pattern: &str, from: i64, until: i64) -> Result<Vec<Series>> {
        let mut metrics = self.db.get_pattern_metrics(pattern).await?;
        if metrics.is_empty() {
            return Ok(Vec::new());
        }
        metrics.sort();
        if self.metrics_ttl > 0 {
            self.db
                .remove_metrics_values(&metrics, until - self.metrics_ttl)
                .await?;
        }
        let values = self.db.get_metrics_values(&metrics, from, until).await?;

        let mut out = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let step = self
                .db
                .get_metric_retention(&metric)
                .await?
                .unwrap_or(DEFAULT_STEP);
            let mut series = Series::empty(metric.as_str(), from, until, step);
            for value in values.get(&metric).into_iter().flatten() {
                if value.retention_timestamp < series.start {
                    continue;
                }
                let slot = ((value.retention_timestamp - series.start) / series.step) as usize;
                if let Some(v) = series.values.get_mut(slot) {
                    *v = Some(value.value);
                }
            }
            out.push(series);
        }
        Ok(out)
    }
}

#[async_trait]
impl MetricSource for LocalSource {
    async fn fetch(&self, target: &str, from: i64, until: i64) -> Result<Vec<Series>> {
        let parsed = Target::parse(target)?;
        let mut resolved = HashMap::new();
        for pattern in parsed.patterns() {
            let series = self.resolve(&pattern, from, until).await?;
            resolved.insert(pattern, series);
        }
        parsed.evaluate(&resolved)
    }
}
