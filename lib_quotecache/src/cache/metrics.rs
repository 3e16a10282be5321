//! # Cache Metrics
//!
//! Monotonic hit/miss/error counters per `CacheType`. Writers are the store
//! (reads, backend failures, failed fetches) and the refresh supervisor
//! (failed background cycles); readers are the admin surface.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::key::CacheType;

#[derive(Debug, Default)]
struct TypeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of one type's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl TypeStats {
    fn new(hits: u64, misses: u64, errors: u64) -> Self {
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };
        Self { hits, misses, errors, hit_rate }
    }
}

/// Snapshot of every type plus the aggregate.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub by_type: BTreeMap<CacheType, TypeStats>,
    /// Backend failures on operations that span several types.
    pub unscoped_errors: u64,
    /// Sum over every type; `errors` includes `unscoped_errors`.
    pub total: TypeStats,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    counters: [TypeCounters; 9],
    unscoped_errors: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, cache_type: CacheType) {
        self.counters[cache_type.index()].hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, cache_type: CacheType) {
        self.counters[cache_type.index()].misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, cache_type: CacheType) {
        self.counters[cache_type.index()].errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a backend failure not attributable to one cache type.
    pub fn record_unscoped_error(&self) {
        self.unscoped_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn type_stats(&self, cache_type: CacheType) -> TypeStats {
        let c = &self.counters[cache_type.index()];
        TypeStats::new(
            c.hits.load(Ordering::Relaxed),
            c.misses.load(Ordering::Relaxed),
            c.errors.load(Ordering::Relaxed),
        )
    }

    pub fn report(&self) -> StatsReport {
        let by_type: BTreeMap<CacheType, TypeStats> =
            CacheType::ALL.into_iter().map(|t| (t, self.type_stats(t))).collect();
        let (hits, misses, errors) = by_type
            .values()
            .fold((0, 0, 0), |(h, m, e), s| (h + s.hits, m + s.misses, e + s.errors));
        let unscoped_errors = self.unscoped_errors.load(Ordering::Relaxed);
        StatsReport { by_type, unscoped_errors, total: TypeStats::new(hits, misses, errors + unscoped_errors) }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for c in &self.counters {
            c.hits.store(0, Ordering::Relaxed);
            c.misses.store(0, Ordering::Relaxed);
            c.errors.store(0, Ordering::Relaxed);
        }
        self.unscoped_errors.store(0, Ordering::Relaxed);
    }
}
