use std::sync::atomic::{AtomicU64, Ordering};

/// Ingest counters read by the telemetry collaborator.
#[derive(Debug, Default)]
pub struct FilterStats {
    pub received: AtomicU64,
    pub invalid: AtomicU64,
    pub matched: AtomicU64,
    pub saved: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterStatsSnapshot {
    pub received: u64,
    pub invalid: u64,
    pub matched: u64,
    pub saved: u64,
}

impl FilterStats {
    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
