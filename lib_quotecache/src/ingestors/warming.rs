//! # Watch-list Warming
//!
//! Keeps a fixed set of popular instruments in the cache even when nobody is
//! subscribed to them. A pass walks every `(instrument, cache type)` pair,
//! skips keys that are already fresh and populates the rest through the
//! store's single-flight path, so a warming pass and a user read for the same
//! key never both go upstream.
//!
//! A failed fetch is recorded in the pass report and the pass carries on; the
//! periodic loop never stops because of a bad cycle.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, CacheType};
use crate::markets::{Instrument, Interval, QuoteSource};

/// Interval warmed for `history` entries.
const WARM_HISTORY_INTERVAL: Interval = Interval::Day1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of one warming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    pub attempted: usize,
    pub skipped_fresh: usize,
    pub warmed: usize,
    pub failures: Vec<WarmFailure>,
}

impl WarmReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Outcome {
    Skipped,
    Warmed,
    Failed(WarmFailure),
}

pub struct WarmingScheduler {
    store: CacheStore,
    source: Arc<dyn QuoteSource>,
    watchlist: Vec<Instrument>,
    cache_types: Vec<CacheType>,
    interval: Duration,
    concurrency: usize,
}

impl WarmingScheduler {
    pub fn new(
        store: CacheStore,
        source: Arc<dyn QuoteSource>,
        watchlist: Vec<Instrument>,
        cache_types: Vec<CacheType>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self { store, source, watchlist, cache_types, interval, concurrency: concurrency.max(1) }
    }

    pub fn watchlist(&self) -> &[Instrument] {
        &self.watchlist
    }

    /// One pass over the configured watch-list.
    pub async fn warm_now(&self) -> WarmReport {
        self.warm_all(&self.watchlist, &self.cache_types).await
    }

    /// Warms every `(instrument, cache type)` pair with bounded concurrency.
    pub async fn warm_all(&self, instruments: &[Instrument], cache_types: &[CacheType]) -> WarmReport {
        let pairs: Vec<(Instrument, CacheType)> = instruments
            .iter()
            .flat_map(|i| cache_types.iter().map(move |t| (i.clone(), *t)))
            .collect();

        let outcomes: Vec<Outcome> = stream::iter(pairs)
            .map(|(instrument, cache_type)| {
                let store = self.store.clone();
                let source = Arc::clone(&self.source);
                async move { warm_one(store, source, instrument, cache_type).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = WarmReport { attempted: outcomes.len(), ..WarmReport::default() };
        for outcome in outcomes {
            match outcome {
                Outcome::Skipped => report.skipped_fresh += 1,
                Outcome::Warmed => report.warmed += 1,
                Outcome::Failed(f) => report.failures.push(f),
            }
        }
        report.failures.sort_by(|a, b| a.key.cmp(&b.key));

        info!(
            attempted = report.attempted,
            warmed = report.warmed,
            skipped = report.skipped_fresh,
            failed = report.failures.len(),
            "warming pass complete"
        );
        report
    }

    /// Warms immediately, then once per interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            instruments = self.watchlist.len(),
            every_secs = self.interval.as_secs(),
            "warming loop started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.warm_now() => {}
            }
        }
        info!("warming loop stopped");
    }
}

async fn warm_one(store: CacheStore, source: Arc<dyn QuoteSource>, instrument: Instrument, cache_type: CacheType) -> Outcome {
    let key = match cache_type {
        CacheType::Quote => CacheKey::quote(&instrument.symbol, &instrument.exchange),
        CacheType::History => CacheKey::history(&instrument.symbol, WARM_HISTORY_INTERVAL),
        other => {
            return Outcome::Failed(WarmFailure {
                key: format!("{}:{}", other.namespace(), instrument),
                error: format!("warming is not supported for cache type '{}'", other),
            });
        }
    };

    if store.contains_fresh(&key).await {
        debug!(key = %key, "already fresh, skipping");
        return Outcome::Skipped;
    }

    let symbol = instrument.symbol.clone();
    let result = if cache_type == CacheType::Quote {
        let exchange = instrument.exchange.clone();
        store
            .populate(&key, move || async move { source.fetch_quote(&symbol, &exchange).await })
            .await
    } else {
        let days = WARM_HISTORY_INTERVAL.lookback_days();
        store
            .populate(&key, move || async move { source.fetch_history(&symbol, WARM_HISTORY_INTERVAL, days).await })
            .await
    };

    match result {
        Ok(true) => Outcome::Warmed,
        // Another fetch filled the key between the check and the populate.
        Ok(false) => Outcome::Skipped,
        Err(e) => {
            warn!(key = %key, error = %e, "warming fetch failed");
            Outcome::Failed(WarmFailure { key: key.to_string(), error: e.to_string() })
        }
    }
}
