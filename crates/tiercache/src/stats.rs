//! Per-cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::{self, LoadOutcome, RefreshMode, Tier};

/// Snapshot of a cache's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served by the in-process tier.
    pub local_hits: u64,
    /// Reads served by the distributed tier.
    pub remote_hits: u64,
    /// Reads that found no entry in either tier.
    pub misses: u64,
    /// Loader calls made under the load lock.
    pub loads: u64,
    /// Loader calls made without the lock after the retry budget ran out.
    pub fallback_loads: u64,
    /// Loader calls that failed or timed out.
    pub failed_loads: u64,
    pub soft_refreshes: u64,
    pub hard_refreshes: u64,
    /// Entries in the in-process tier (approximate).
    pub local_entries: u64,
}

impl CacheStats {
    /// Share of reads served from either tier, in percent.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.remote_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Shared counters feeding both [`CacheStats`] and the metrics facade.
#[derive(Debug)]
pub(crate) struct StatsCounters {
    name: String,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    fallback_loads: AtomicU64,
    failed_loads: AtomicU64,
    soft_refreshes: AtomicU64,
    hard_refreshes: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            fallback_loads: AtomicU64::new(0),
            failed_loads: AtomicU64::new(0),
            soft_refreshes: AtomicU64::new(0),
            hard_refreshes: AtomicU64::new(0),
        }
    }

    pub(crate) fn hit(&self, tier: Tier) {
        match tier {
            Tier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            Tier::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
        metrics::record_hit(&self.name, tier);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_miss(&self.name);
    }

    pub(crate) fn load(&self, outcome: LoadOutcome) {
        let counter = match outcome {
            LoadOutcome::Locked => &self.loads,
            LoadOutcome::Fallback => &self.fallback_loads,
            LoadOutcome::Failed => &self.failed_loads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_load(&self.name, outcome);
    }

    pub(crate) fn refresh(&self, mode: RefreshMode) {
        match mode {
            RefreshMode::Soft => self.soft_refreshes.fetch_add(1, Ordering::Relaxed),
            RefreshMode::Hard => self.hard_refreshes.fetch_add(1, Ordering::Relaxed),
        };
        metrics::record_refresh(&self.name, mode);
    }

    pub(crate) fn snapshot(&self, local_entries: u64) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            fallback_loads: self.fallback_loads.load(Ordering::Relaxed),
            failed_loads: self.failed_loads.load(Ordering::Relaxed),
            soft_refreshes: self.soft_refreshes.load(Ordering::Relaxed),
            hard_refreshes: self.hard_refreshes.load(Ordering::Relaxed),
            local_entries,
        }
    }
}
