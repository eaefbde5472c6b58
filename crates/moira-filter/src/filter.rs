use crate::lru::LruCache;
use crate::patterns::PatternStorage;
use crate::retention::{RetentionCache, RetentionConfig};
use crate::stats::FilterStats;
use moira_common::types::{MatchedMetric, MetricPoint};
use moira_storage::retry::with_backoff;
use moira_storage::{counters, DynDatabase};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub workers: usize,
    /// Points buffered per worker before producers wait.
    pub queue_size: usize,
    /// Metrics remembered per worker for deduplication and retention lookup.
    pub cache_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 10_000,
            cache_capacity: 100_000,
            batch_size: 1_000,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// Front of the filter worker pool.
///
/// Each worker owns the metrics whose name hashes to it, so the per-metric
/// caches are never shared.
#[derive(Clone)]
pub struct MetricFilter {
    shards: Arc<[mpsc::Sender<MetricPoint>]>,
    stats: Arc<FilterStats>,
}

impl MetricFilter {
    pub fn spawn(
        db: DynDatabase,
        patterns: Arc<PatternStorage>,
        retentions: Arc<RetentionConfig>,
        settings: FilterSettings,
        stats: Arc<FilterStats>,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = settings.workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
            let worker = Worker {
                id,
                db: db.clone(),
                patterns: patterns.clone(),
                retentions: RetentionCache::new(retentions.clone(), settings.cache_capacity),
                written: LruCache::new(settings.cache_capacity),
                batch: Vec::with_capacity(settings.batch_size),
                received: 0,
                settings: settings.clone(),
                stats: stats.clone(),
            };
            handles.push(tokio::spawn(worker.run(rx, cancel.clone())));
            shards.push(tx);
        }
        (
            Self {
                shards: shards.into(),
                stats,
            },
            handles,
        )
    }

    pub fn stats(&self) -> &Arc<FilterStats> {
        &self.stats
    }

    /// Queues a parsed point, waiting while its worker is full. Returns
    /// `false` once the worker has stopped.
    pub async fn submit(&self, point: MetricPoint) -> bool {
        let mut hasher = DefaultHasher::new();
        point.name.hash(&mut hasher);
        point.labels.hash(&mut hasher);
        let shard = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[shard].send(point).await.is_ok()
    }
}

struct Worker {
    id: usize,
    db: DynDatabase,
    patterns: Arc<PatternStorage>,
    retentions: RetentionCache,
    /// Last `(retention_timestamp, value bits)` written per metric.
    written: LruCache<String, (i64, u64)>,
    batch: Vec<MatchedMetric>,
    received: i64,
    settings: FilterSettings,
    stats: Arc<FilterStats>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<MetricPoint>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                point = rx.recv() => match point {
                    Some(point) => {
                        self.handle(point);
                        if self.batch.len() >= self.settings.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
                _ = cancel.cancelled() => break,
            }
        }
        while let Ok(point) = rx.try_recv() {
            self.handle(point);
        }
        self.flush().await;
        tracing::info!(worker = self.id, "Filter worker stopped");
    }

    fn handle(&mut self, point: MetricPoint) {
        self.received += 1;
        let patterns = self.patterns.load().match_point(&point);
        if patterns.is_empty() {
            return;
        }
        FilterStats::add(&self.stats.matched, 1);

        let full_name = point.full_name();
        let retention = self.retentions.retention(&full_name);
        let matched = MatchedMetric::new(&point, patterns, retention);
        let fingerprint = (matched.retention_timestamp, matched.value.to_bits());
        if self.written.get(&full_name) == Some(&fingerprint) {
            return;
        }
        self.written.insert(full_name, fingerprint);
        self.batch.push(matched);
    }

    async fn flush(&mut self) {
        if self.received > 0 {
            let received = std::mem::take(&mut self.received);
            if let Err(e) = self
                .db
                .increment_counter(counters::METRICS_RECEIVED, received)
                .await
            {
                tracing::warn!(error = %e, "Failed to bump metrics heartbeat");
            }
        }
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let db = self.db.clone();
        let result = with_backoff("save_metrics", 3, Duration::from_millis(100), || {
            db.save_metrics(&batch)
        })
        .await;
        match result {
            Ok(()) => FilterStats::add(&self.stats.saved, batch.len() as u64),
            Err(e) => {
                tracing::error!(worker = self.id, count = batch.len(), error = %e, "Failed to save metrics");
                // A resent point must not look already written.
                for m in &batch {
                    let fingerprint = (m.retention_timestamp, m.value.to_bits());
                    self.written.remove_if(&m.metric, &fingerprint);
                }
            }
        }
    }
}
