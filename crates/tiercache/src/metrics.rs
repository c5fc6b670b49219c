//! Metrics emitted by the cache engine.
//!
//! Counters go through the `metrics` facade. The library installs no
//! recorder; applications pick their own exporter.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const HITS_TOTAL: &str = "tiercache_hits_total";
    pub const MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const LOADS_TOTAL: &str = "tiercache_loads_total";
    pub const REFRESHES_TOTAL: &str = "tiercache_refreshes_total";
    pub const INVALIDATIONS_TOTAL: &str = "tiercache_invalidations_total";
}

/// Tier that served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Remote => "remote",
        }
    }
}

/// How a load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Loaded while holding the load lock.
    Locked,
    /// Loaded without the lock after the retry budget ran out.
    Fallback,
    /// The loader failed or timed out.
    Failed,
}

impl LoadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadOutcome::Locked => "locked",
            LoadOutcome::Fallback => "fallback",
            LoadOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Soft,
    Hard,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Soft => "soft",
            RefreshMode::Hard => "hard",
        }
    }
}

pub fn record_hit(cache: &str, tier: Tier) {
    counter!(names::HITS_TOTAL, "cache" => cache.to_string(), "tier" => tier.as_str()).increment(1);
}

pub fn record_miss(cache: &str) {
    counter!(names::MISSES_TOTAL, "cache" => cache.to_string()).increment(1);
}

pub fn record_load(cache: &str, outcome: LoadOutcome) {
    counter!(names::LOADS_TOTAL, "cache" => cache.to_string(), "outcome" => outcome.as_str())
        .increment(1);
}

pub fn record_refresh(cache: &str, mode: RefreshMode) {
    counter!(names::REFRESHES_TOTAL, "cache" => cache.to_string(), "mode" => mode.as_str())
        .increment(1);
}

/// `kind` is `"evict"` or `"clear"`.
pub fn record_invalidation(cache: &str, kind: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "cache" => cache.to_string(), "kind" => kind)
        .increment(1);
}
