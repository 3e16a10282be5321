//! # Refresh Supervisor
//!
//! Reference-counted background refresh per `(symbol, interval)`. The first
//! subscriber starts a loop that rewrites the history entry every half TTL;
//! the last unsubscriber cancels it and waits for it to exit. The supervisor
//! is the only authority that starts or stops loops, and the ref-count map is
//! guarded by a single lock so concurrent subscribe/unsubscribe calls for the
//! same pair serialize cleanly.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, CacheType};
use crate::markets::{Interval, QuoteSource};

/// Shortest refresh cadence, whatever the TTL table says.
const MIN_CADENCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self { symbol: symbol.trim().to_ascii_uppercase(), interval }
    }
}

struct Subscription {
    ref_count: u32,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Counters {
    loops_started: AtomicU64,
    loops_stopped: AtomicU64,
    refresh_ok: AtomicU64,
    refresh_failed: AtomicU64,
}

/// Supervisor introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStats {
    pub active: usize,
    pub loops_started: u64,
    pub loops_stopped: u64,
    pub refresh_ok: u64,
    pub refresh_failed: u64,
}

pub struct RefreshSupervisor {
    store: CacheStore,
    source: Arc<dyn QuoteSource>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    counters: Arc<Counters>,
}

impl RefreshSupervisor {
    pub fn new(store: CacheStore, source: Arc<dyn QuoteSource>) -> Self {
        Self {
            store,
            source,
            subscriptions: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers interest; starts the loop on the first subscriber. Returns the new ref count.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, symbol: &str, interval: Interval) -> u32 {
        let key = SubscriptionKey::new(symbol, interval);
        let mut subs = self.lock();

        if let Some(sub) = subs.get_mut(&key) {
            sub.ref_count += 1;
            debug!(symbol = %key.symbol, interval = %key.interval, ref_count = sub.ref_count, "subscription joined");
            return sub.ref_count;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh_loop(
            self.store.clone(),
            Arc::clone(&self.source),
            key.clone(),
            cancel.clone(),
            Arc::clone(&self.counters),
        ));
        self.counters.loops_started.fetch_add(1, Ordering::Relaxed);
        info!(symbol = %key.symbol, interval = %key.interval, "refresh loop started");
        subs.insert(key, Subscription { ref_count: 1, cancel, handle });
        1
    }

    /// Drops one unit of interest. On the last one the loop is cancelled and
    /// awaited before returning. Returns the remaining ref count; unknown
    /// pairs are a no-op returning 0.
    pub async fn unsubscribe(&self, symbol: &str, interval: Interval) -> u32 {
        let key = SubscriptionKey::new(symbol, interval);
        let stopped = {
            let mut subs = self.lock();
            let Some(sub) = subs.get_mut(&key) else {
                debug!(symbol = %key.symbol, interval = %key.interval, "unsubscribe for inactive pair ignored");
                return 0;
            };
            sub.ref_count = sub.ref_count.saturating_sub(1);
            if sub.ref_count > 0 {
                return sub.ref_count;
            }
            subs.remove(&key)
        };

        if let Some(sub) = stopped {
            sub.cancel.cancel();
            if let Err(e) = sub.handle.await {
                warn!(symbol = %key.symbol, interval = %key.interval, error = %e, "refresh loop ended abnormally");
            }
        }
        0
    }

    pub fn ref_count(&self, symbol: &str, interval: Interval) -> u32 {
        self.lock().get(&SubscriptionKey::new(symbol, interval)).map_or(0, |s| s.ref_count)
    }

    pub fn is_active(&self, symbol: &str, interval: Interval) -> bool {
        self.ref_count(symbol, interval) > 0
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            active: self.lock().len(),
            loops_started: self.counters.loops_started.load(Ordering::Relaxed),
            loops_stopped: self.counters.loops_stopped.load(Ordering::Relaxed),
            refresh_ok: self.counters.refresh_ok.load(Ordering::Relaxed),
            refresh_failed: self.counters.refresh_failed.load(Ordering::Relaxed),
        }
    }

    /// Cancels every loop regardless of ref counts and waits for all of them.
    pub async fn shutdown(&self) {
        let drained: Vec<(SubscriptionKey, Subscription)> = self.lock().drain().collect();
        for (_, sub) in &drained {
            sub.cancel.cancel();
        }
        for (key, sub) in drained {
            if let Err(e) = sub.handle.await {
                warn!(symbol = %key.symbol, interval = %key.interval, error = %e, "refresh loop ended abnormally");
            }
        }
    }
}

async fn refresh_loop(
    store: CacheStore,
    source: Arc<dyn QuoteSource>,
    key: SubscriptionKey,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let cache_key = CacheKey::history(&key.symbol, key.interval);

    loop {
        // Re-derived each cycle so a session change shifts the cadence.
        let cadence = (store.ttl_for(CacheType::History) / 2).max(MIN_CADENCE);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(cadence) => {}
        }

        let source = Arc::clone(&source);
        let symbol = key.symbol.clone();
        let interval = key.interval;
        let fetch = move || async move { source.fetch_history(&symbol, interval, interval.lookback_days()).await };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = store.refresh(&cache_key, fetch) => outcome,
        };

        match outcome {
            Ok(()) => {
                counters.refresh_ok.fetch_add(1, Ordering::Relaxed);
                debug!(key = %cache_key, "background refresh stored");
            }
            Err(e) => {
                counters.refresh_failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %cache_key, error = %e, "background refresh failed; retrying next cycle");
            }
        }
    }

    counters.loops_stopped.fetch_add(1, Ordering::Relaxed);
    info!(symbol = %key.symbol, interval = %key.interval, "refresh loop stopped");
}
