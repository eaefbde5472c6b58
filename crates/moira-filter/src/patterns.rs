use crate::error::Result;
use crate::index::tags::RegexTreatment;
use crate::index::{MatcherCache, PatternIndex};
use arc_swap::ArcSwap;
use moira_storage::DynDatabase;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Holds the published [`PatternIndex`] and rebuilds it from the store.
///
/// Readers call [`PatternStorage::load`] and never block; a refresh builds a
/// complete new index and swaps it in with a single pointer store.
pub struct PatternStorage {
    db: DynDatabase,
    index: ArcSwap<PatternIndex>,
    cache: Mutex<MatcherCache>,
    treatment: RegexTreatment,
}

impl PatternStorage {
    pub fn new(db: DynDatabase, treatment: RegexTreatment, cache_size: usize) -> Self {
        Self {
            db,
            index: ArcSwap::from_pointee(PatternIndex::default()),
            cache: Mutex::new(MatcherCache::new(cache_size)),
            treatment,
        }
    }

    pub fn load(&self) -> Arc<PatternIndex> {
        self.index.load_full()
    }

    /// Rebuilds from the current pattern set. Returns the indexed count.
    pub async fn refresh(&self) -> Result<usize> {
        let patterns = self.db.get_patterns().await?;
        let index = {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            PatternIndex::build(&patterns, &mut cache, self.treatment)
        };
        let size = index.len();
        self.index.store(Arc::new(index));
        tracing::debug!(patterns = size, "Pattern index refreshed");
        Ok(size)
    }

    /// Refreshes every `interval` until cancelled. Failures keep the
    /// previous index.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::error!(error = %e, "Pattern index refresh failed");
                    }
                }
            }
        }
        tracing::info!("Pattern refresh loop stopped");
    }
}
