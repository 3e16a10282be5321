//! # Market Snapshot Capture
//!
//! At fixed wall-clock times each trading day (e.g. 09:00 and 15:45 exchange
//! time) the scheduler fetches the headline indices and a fixed instrument
//! universe, derives breadth and per-sector averages, and writes one immutable
//! `SnapshotRecord` keyed by `(date, captureTime)`.
//!
//! ## Partial captures
//! An instrument that fails to fetch is logged and left out. The record
//! carries both `universeSize` and `capturedCount`, so a partial snapshot is
//! valid and visibly partial; a capture never fails because of missing
//! instruments.
//!
//! ## Triggers
//! `cron_expressions()` renders each trigger as a six-field weekday cron line
//! in the market timezone. With the `scheduler` feature, `start()` registers
//! those lines on a `tokio-cron-scheduler` `JobScheduler`.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::error::{CacheError, FetchError};
use crate::markets::{with_timeout, Instrument, MarketHours, Quote, QuoteSource};

/// Member of the snapshot universe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseMember {
    pub symbol: String,
    pub exchange: String,
    pub sector: String,
}

impl UniverseMember {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>, sector: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), exchange: exchange.into(), sector: sector.into() }
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(self.symbol.clone(), self.exchange.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadth {
    pub advancing: usize,
    pub declining: usize,
    pub unchanged: usize,
}

/// One captured market snapshot. Written once, never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub date: NaiveDate,
    pub capture_time: String,
    pub captured_at: DateTime<Utc>,
    pub universe_size: usize,
    pub captured_count: usize,
    /// Keyed by `SYMBOL:EXCHANGE`.
    pub indices: BTreeMap<String, Quote>,
    /// Keyed by `SYMBOL:EXCHANGE`.
    pub quotes: BTreeMap<String, Quote>,
    pub breadth: Breadth,
    /// Average percentage change per sector over captured members.
    pub sectors: BTreeMap<String, f64>,
    /// Universe members and indices that could not be fetched.
    pub missing: Vec<String>,
}

impl SnapshotRecord {
    pub fn is_partial(&self) -> bool {
        self.captured_count < self.universe_size
    }
}

pub struct SnapshotScheduler {
    store: CacheStore,
    source: Arc<dyn QuoteSource>,
    hours: MarketHours,
    triggers: Vec<NaiveTime>,
    indices: Vec<Instrument>,
    universe: Vec<UniverseMember>,
    concurrency: usize,
}

impl SnapshotScheduler {
    pub fn new(
        store: CacheStore,
        source: Arc<dyn QuoteSource>,
        hours: MarketHours,
        triggers: Vec<NaiveTime>,
        indices: Vec<Instrument>,
        universe: Vec<UniverseMember>,
        concurrency: usize,
    ) -> Self {
        Self { store, source, hours, triggers, indices, universe, concurrency: concurrency.max(1) }
    }

    pub fn triggers(&self) -> &[NaiveTime] {
        &self.triggers
    }

    /// Six-field cron lines (`sec min hour dom mon dow`), weekdays only.
    pub fn cron_expressions(&self) -> Vec<String> {
        self.triggers
            .iter()
            .map(|t| format!("0 {} {} * * Mon-Fri", t.minute(), t.hour()))
            .collect()
    }

    /// Captures now, labelled with the current exchange-local time to the second.
    pub async fn snapshot_now(&self) -> Result<SnapshotRecord, CacheError> {
        let now = self.store.clock().now().with_timezone(&self.hours.timezone);
        self.capture(&now.format("%H:%M:%S").to_string()).await
    }

    /// Captures one snapshot for today under `capture_time`. If a record for
    /// the same `(date, capture_time)` already exists it is returned unchanged;
    /// concurrent captures of the same key share one fetch of the universe.
    pub async fn capture(&self, capture_time: &str) -> Result<SnapshotRecord, CacheError> {
        let captured_at = self.store.clock().now();
        let date = self.hours.local_date(captured_at);
        let key = CacheKey::snapshot(date, capture_time);

        let plan = CapturePlan {
            source: Arc::clone(&self.source),
            indices: self.indices.clone(),
            universe: self.universe.clone(),
            concurrency: self.concurrency,
            per_fetch: self.store.options().fetch_timeout,
            date,
            capture_time: capture_time.to_string(),
            captured_at,
        };
        let limit = plan.budget();
        self.store
            .get_or_fetch_within(&key, limit, move || async move { Ok(plan.run().await) })
            .await
    }

    /// Registers one cron job per trigger and starts the scheduler. The
    /// returned handle must be kept alive; call `shutdown()` on it to stop.
    #[cfg(feature = "scheduler")]
    pub async fn start(self: Arc<Self>) -> Result<tokio_cron_scheduler::JobScheduler, CacheError> {
        use tokio_cron_scheduler::{JobBuilder, JobScheduler};

        let scheduler = JobScheduler::new().await?;
        for (trigger, expression) in self.triggers.iter().zip(self.cron_expressions()) {
            let label = trigger.format("%H:%M").to_string();
            let this = Arc::clone(&self);
            let job = JobBuilder::new()
                .with_timezone(self.hours.timezone)
                .with_cron_job_type()
                .with_schedule(expression.as_str())?
                .with_run_async(Box::new(move |_uuid, _lock| {
                    let this = Arc::clone(&this);
                    let label = label.clone();
                    Box::pin(async move {
                        if let Err(e) = this.capture(&label).await {
                            warn!(trigger = %label, error = %e, "scheduled snapshot failed");
                        }
                    })
                }))
                .build()?;
            scheduler.add(job).await?;
            info!(cron = %expression, timezone = %self.hours.timezone, "snapshot trigger registered");
        }
        scheduler.start().await?;
        Ok(scheduler)
    }
}

/// Everything one capture needs, owned so the fetch can outlive its caller.
struct CapturePlan {
    source: Arc<dyn QuoteSource>,
    indices: Vec<Instrument>,
    universe: Vec<UniverseMember>,
    concurrency: usize,
    per_fetch: Duration,
    date: NaiveDate,
    capture_time: String,
    captured_at: DateTime<Utc>,
}

impl CapturePlan {
    /// Worst case for both fetch rounds, each bounded per instrument.
    fn budget(&self) -> Duration {
        let rounds = |n: usize| n.div_ceil(self.concurrency).max(1) as u32;
        self.per_fetch * (rounds(self.indices.len()) + rounds(self.universe.len()) + 1)
    }

    async fn run(self) -> SnapshotRecord {
        let mut missing = Vec::new();

        let index_results = self.fetch_all(self.indices.iter().cloned()).await;
        let mut indices = BTreeMap::new();
        for (instrument, result) in index_results {
            match result {
                Ok(q) => {
                    indices.insert(instrument.to_string(), q);
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "index omitted from snapshot");
                    missing.push(instrument.to_string());
                }
            }
        }

        let sector_of: BTreeMap<String, &str> =
            self.universe.iter().map(|m| (m.instrument().to_string(), m.sector.as_str())).collect();
        let member_results = self.fetch_all(self.universe.iter().map(UniverseMember::instrument)).await;

        let mut quotes = BTreeMap::new();
        let mut breadth = Breadth::default();
        let mut sector_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for (instrument, result) in member_results {
            let id = instrument.to_string();
            match result {
                Ok(q) => {
                    if q.price > q.prev_close {
                        breadth.advancing += 1;
                    } else if q.price < q.prev_close {
                        breadth.declining += 1;
                    } else {
                        breadth.unchanged += 1;
                    }
                    if let Some(sector) = sector_of.get(&id) {
                        let slot = sector_sums.entry((*sector).to_string()).or_insert((0.0, 0));
                        slot.0 += q.change_pct();
                        slot.1 += 1;
                    }
                    quotes.insert(id, q);
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "instrument omitted from snapshot");
                    missing.push(id);
                }
            }
        }

        let sectors = sector_sums
            .into_iter()
            .map(|(sector, (sum, n))| (sector, sum / n as f64))
            .collect();
        missing.sort();

        let record = SnapshotRecord {
            date: self.date,
            capture_time: self.capture_time.clone(),
            captured_at: self.captured_at,
            universe_size: self.universe.len(),
            captured_count: quotes.len(),
            indices,
            quotes,
            breadth,
            sectors,
            missing,
        };
        info!(
            date = %record.date,
            capture_time = %record.capture_time,
            captured = record.captured_count,
            universe = record.universe_size,
            partial = record.is_partial(),
            "snapshot captured"
        );
        record
    }

    async fn fetch_all<I>(&self, instruments: I) -> Vec<(Instrument, Result<Quote, FetchError>)>
    where
        I: IntoIterator<Item = Instrument>,
    {
        let limit = self.per_fetch;
        stream::iter(instruments)
            .map(|instrument| {
                let source = Arc::clone(&self.source);
                async move {
                    let result =
                        with_timeout(limit, source.fetch_quote(&instrument.symbol, &instrument.exchange)).await;
                    (instrument, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}
