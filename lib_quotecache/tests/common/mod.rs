#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_quotecache::cache::{CacheBackend, CacheEntry};
use lib_quotecache::core::{Batch, BatchSink};
use lib_quotecache::markets::{Candle, Interval, ManualClock, MarketSession, Quote, QuoteSource};
use lib_quotecache::{BackendError, FetchError};

/// Monday 2026-10-19 10:30 IST.
pub fn market_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 5, 0, 0).unwrap()
}

pub fn open_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(market_morning(), MarketSession::Open))
}

pub fn quote_at(price: f64, prev_close: f64) -> Quote {
    Quote {
        price,
        open: prev_close,
        high: price.max(prev_close),
        low: price.min(prev_close),
        volume: 1_000,
        prev_close,
        timestamp: market_morning(),
    }
}

/// In-memory upstream with call counters, optional latency and per-symbol failures.
pub struct ScriptedSource {
    pub quote_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    delay: Duration,
    default_price: f64,
    prices: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
}

impl ScriptedSource {
    pub fn new(default_price: f64) -> Self {
        Self {
            quote_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            default_price,
            prices: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    fn check(&self, symbol: &str) -> Result<(), FetchError> {
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(symbol) {
            return Err(FetchError::Upstream(format!("{} unavailable", symbol)));
        }
        Ok(())
    }
}

#[async_trait]
impl QuoteSource for ScriptedSource {
    async fn fetch_quote(&self, symbol: &str, _exchange: &str) -> Result<Quote, FetchError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.check(symbol)?;
        let price = self.prices.lock().unwrap().get(symbol).copied().unwrap_or(self.default_price);
        Ok(quote_at(price, 100.0))
    }

    async fn fetch_history(&self, symbol: &str, _interval: Interval, days: u32) -> Result<Vec<Candle>, FetchError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.check(symbol)?;
        let candles = (0..days.min(3))
            .map(|i| Candle {
                timestamp: market_morning() - chrono::Duration::days(i64::from(i)),
                o: self.default_price,
                h: self.default_price,
                l: self.default_price,
                c: self.default_price,
                v: 10,
            })
            .collect();
        Ok(candles)
    }
}

/// A backend that is never reachable.
pub struct DownBackend;

#[async_trait]
impl CacheBackend for DownBackend {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _entry: CacheEntry, _retain_for: Duration) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<usize, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }
}

/// Records every delivered batch.
#[derive(Default)]
pub struct CollectingSink {
    pub batches: Mutex<Vec<Batch>>,
}

impl CollectingSink {
    pub fn count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn all(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }
}

impl BatchSink for CollectingSink {
    fn on_batch_ready(&self, batch: Batch) {
        self.batches.lock().unwrap().push(batch);
    }
}
