//! Seeded random-walk market data, standing in for a broker API so the server
//! runs end to end without credentials.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use lib_quotecache::core::Tick;
use lib_quotecache::markets::{Candle, Interval, Quote, QuoteSource};
use lib_quotecache::{CacheEngine, FetchError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Largest candle series one history call returns.
const MAX_CANDLES: u32 = 1_000;

struct WalkState {
    rng: StdRng,
    /// Last price and previous close per `SYMBOL:EXCHANGE`.
    prices: HashMap<String, (f64, f64)>,
}

pub struct SyntheticQuoteSource {
    state: Mutex<WalkState>,
    latency: Duration,
    failure_rate: f64,
}

impl SyntheticQuoteSource {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(WalkState { rng: StdRng::seed_from_u64(seed), prices: HashMap::new() }),
            latency: Duration::from_millis(40),
            failure_rate: 0.01,
        }
    }

    /// Starting price derived from the symbol so restarts look alike.
    fn seed_price(symbol: &str) -> f64 {
        let sum: u32 = symbol.bytes().map(u32::from).sum();
        100.0 + f64::from(sum % 4_900)
    }

    fn next_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, FetchError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.rng.random_bool(self.failure_rate) {
            return Err(FetchError::Upstream(format!("synthetic outage for {}", symbol)));
        }

        let step = state.rng.random_range(-0.01..0.01);
        let volume = state.rng.random_range(1_000..500_000);
        let key = format!("{}:{}", symbol, exchange);
        let start = Self::seed_price(symbol);
        let (price, prev_close) = state.prices.entry(key).or_insert((start, start));
        *price = (*price * (1.0 + step)).max(0.05);

        Ok(Quote {
            price: *price,
            open: *prev_close,
            high: price.max(*prev_close),
            low: price.min(*prev_close),
            volume,
            prev_close: *prev_close,
            timestamp: Utc::now(),
        })
    }
}

fn bars_per_day(interval: Interval) -> f64 {
    match interval {
        Interval::Minute1 => 375.0,
        Interval::Minute5 => 75.0,
        Interval::Minute15 => 25.0,
        Interval::Hour1 => 7.0,
        Interval::Day1 => 1.0,
        Interval::Week1 => 1.0 / 5.0,
    }
}

fn bar_length(interval: Interval) -> ChronoDuration {
    match interval {
        Interval::Minute1 => ChronoDuration::minutes(1),
        Interval::Minute5 => ChronoDuration::minutes(5),
        Interval::Minute15 => ChronoDuration::minutes(15),
        Interval::Hour1 => ChronoDuration::hours(1),
        Interval::Day1 => ChronoDuration::days(1),
        Interval::Week1 => ChronoDuration::weeks(1),
    }
}

#[async_trait]
impl QuoteSource for SyntheticQuoteSource {
    async fn fetch_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, FetchError> {
        if symbol.trim().is_empty() {
            return Err(FetchError::NotFound("empty symbol".into()));
        }
        tokio::time::sleep(self.latency).await;
        self.next_quote(symbol, exchange)
    }

    async fn fetch_history(&self, symbol: &str, interval: Interval, days: u32) -> Result<Vec<Candle>, FetchError> {
        if symbol.trim().is_empty() {
            return Err(FetchError::NotFound("empty symbol".into()));
        }
        tokio::time::sleep(self.latency * 2).await;

        let count = ((f64::from(days) * bars_per_day(interval)).ceil() as u32).clamp(1, MAX_CANDLES);
        let bar = bar_length(interval);
        let now = Utc::now();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut close = Self::seed_price(symbol);
        let candles = (0..count)
            .rev()
            .map(|i| {
                let open = close;
                close = (open * (1.0 + state.rng.random_range(-0.02..0.02))).max(0.05);
                Candle {
                    timestamp: now - bar * i as i32,
                    o: open,
                    h: open.max(close) * 1.002,
                    l: open.min(close) * 0.998,
                    c: close,
                    v: state.rng.random_range(10_000..2_000_000),
                }
            })
            .collect();
        Ok(candles)
    }
}

/// Pushes random-walk ticks for `instruments` tokens into the engine at `rate_hz` until cancelled.
pub async fn run_tick_feed(engine: Arc<CacheEngine>, instruments: u32, rate_hz: u32, seed: u64, cancel: CancellationToken) {
    let instruments = instruments.max(1);
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let mut prices: Vec<f64> = (0..instruments).map(|_| rng.random_range(50.0..5_000.0)).collect();

    // Emit in bursts of up to 1 ms worth of ticks so high rates don't need sub-millisecond timers.
    let per_ms = (rate_hz / 1_000).max(1);
    let period = Duration::from_micros(u64::from(1_000_000 / rate_hz.max(1)) * u64::from(per_ms));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(instruments, rate_hz, "synthetic tick feed started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for _ in 0..per_ms {
                    let token = rng.random_range(0..instruments);
                    let price = &mut prices[token as usize];
                    *price = (*price * (1.0 + rng.random_range(-0.0005..0.0005))).max(0.05);
                    engine.add_tick(Tick::new(token, *price, Utc::now()));
                }
            }
        }
    }
    info!("synthetic tick feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_seed_same_walk() {
        let a = SyntheticQuoteSource { failure_rate: 0.0, latency: Duration::ZERO, ..SyntheticQuoteSource::new(7) };
        let b = SyntheticQuoteSource { failure_rate: 0.0, latency: Duration::ZERO, ..SyntheticQuoteSource::new(7) };
        for _ in 0..5 {
            let qa = a.fetch_quote("RELIANCE", "NSE").await.unwrap();
            let qb = b.fetch_quote("RELIANCE", "NSE").await.unwrap();
            assert_eq!(qa.price, qb.price);
            assert!(qa.low <= qa.price && qa.price <= qa.high);
        }
    }

    #[tokio::test]
    async fn history_length_follows_interval() {
        let source = SyntheticQuoteSource { latency: Duration::ZERO, ..SyntheticQuoteSource::new(1) };
        let daily = source.fetch_history("TCS", Interval::Day1, 30).await.unwrap();
        assert_eq!(daily.len(), 30);
        assert!(daily.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let minutes = source.fetch_history("TCS", Interval::Minute1, 5).await.unwrap();
        assert_eq!(minutes.len(), MAX_CANDLES as usize);
    }

    #[tokio::test]
    async fn empty_symbol_is_not_found() {
        let source = SyntheticQuoteSource::new(1);
        assert!(matches!(source.fetch_quote(" ", "NSE").await, Err(FetchError::NotFound(_))));
    }
}
