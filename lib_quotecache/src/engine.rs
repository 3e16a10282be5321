//! # Cache Engine
//!
//! Wires the store, refresh supervisor, warming loop, tick batcher and
//! snapshot scheduler together from one `EngineConfig` and the injected
//! collaborators (`QuoteSource`, `Clock`, `CacheBackend`, `BatchSink`), and
//! exposes the admin surface the delivery layer talks to.
//!
//! Lifecycle is explicit: `new` validates and builds, `start` launches the
//! background tasks, `shutdown` cancels them and waits until each has exited
//! (the flush loop delivers one final batch on the way out).

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheBackend, CacheKey, CacheMetrics, CacheStore, Invalidation, StatsReport};
use crate::config::EngineConfig;
use crate::core::{BatchScheduler, BatchSink, BatchStats, RefreshSupervisor, SupervisorStats, Tick};
use crate::error::CacheError;
use crate::ingestors::{SnapshotRecord, SnapshotScheduler, WarmReport, WarmingScheduler};
use crate::markets::{Candle, Clock, Interval, MarketSession, Quote, QuoteSource};

/// Everything the admin surface reports in one read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub session: MarketSession,
    pub cache: StatsReport,
    pub refresh: SupervisorStats,
    pub batching: BatchStats,
    pub inflight_fetches: usize,
}

pub struct CacheEngine {
    store: CacheStore,
    supervisor: RefreshSupervisor,
    warming: Arc<WarmingScheduler>,
    batcher: BatchScheduler,
    snapshot: Arc<SnapshotScheduler>,
    source: Arc<dyn QuoteSource>,
    config: EngineConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(feature = "scheduler")]
    cron: tokio::sync::Mutex<Option<tokio_cron_scheduler::JobScheduler>>,
}

impl CacheEngine {
    /// Validates `config` and builds every component. Nothing runs until `start()`.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn QuoteSource>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn CacheBackend>,
        sink: Arc<dyn BatchSink>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let store = CacheStore::with_parts(
            backend,
            clock,
            config.policy()?,
            Arc::new(CacheMetrics::new()),
            config.store_options(),
        );
        let supervisor = RefreshSupervisor::new(store.clone(), Arc::clone(&source));
        let warming = WarmingScheduler::new(
            store.clone(),
            Arc::clone(&source),
            config.watchlist.clone(),
            config.warm_cache_types()?,
            config.warm_interval(),
            config.warm_concurrency,
        );
        let batcher = BatchScheduler::new(sink, config.batch_interval(), config.max_batch_size);
        let snapshot = SnapshotScheduler::new(
            store.clone(),
            Arc::clone(&source),
            config.market_hours()?,
            config.snapshot_triggers()?,
            config.snapshot.indices.clone(),
            config.snapshot.universe.clone(),
            config.snapshot_concurrency,
        );

        Ok(Self {
            store,
            supervisor,
            warming: Arc::new(warming),
            batcher,
            snapshot: Arc::new(snapshot),
            source,
            config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            #[cfg(feature = "scheduler")]
            cron: tokio::sync::Mutex::new(None),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &RefreshSupervisor {
        &self.supervisor
    }

    /// Launches warming, batching, the janitor and (with `scheduler`) the snapshot triggers.
    /// Calling it twice is a no-op.
    pub async fn start(&self) -> Result<(), CacheError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.batcher.start();

        let warming = Arc::clone(&self.warming);
        let token = self.cancel.child_token();
        let warm_task = tokio::spawn(async move { warming.run(token).await });
        let janitor = self.store.spawn_janitor(self.config.janitor_interval(), self.cancel.child_token());
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.push(warm_task);
            tasks.push(janitor);
        }

        #[cfg(feature = "scheduler")]
        {
            let scheduler = Arc::clone(&self.snapshot).start().await?;
            *self.cron.lock().await = Some(scheduler);
        }
        #[cfg(not(feature = "scheduler"))]
        {
            if !self.snapshot.triggers().is_empty() {
                warn!("snapshot triggers configured but the scheduler feature is disabled; use snapshot_now()");
            }
        }

        info!(
            watchlist = self.config.watchlist.len(),
            batch_interval_ms = self.config.batch_interval_ms,
            "cache engine started"
        );
        Ok(())
    }

    /// Stops every background task and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        #[cfg(feature = "scheduler")]
        {
            let scheduler = self.cron.lock().await.take();
            if let Some(mut scheduler) = scheduler {
                if let Err(e) = scheduler.shutdown().await {
                    warn!(error = %e, "snapshot scheduler did not shut down cleanly");
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        self.supervisor.shutdown().await;
        self.batcher.stop().await;
        info!("cache engine stopped");
    }

    /// Cached quote, fetched once on a miss.
    pub async fn quote(&self, symbol: &str, exchange: &str) -> Result<Quote, CacheError> {
        let key = CacheKey::quote(symbol, exchange);
        let source = Arc::clone(&self.source);
        let (symbol, exchange) = (symbol.to_string(), exchange.to_string());
        self.store
            .get_or_fetch(&key, move || async move { source.fetch_quote(&symbol, &exchange).await })
            .await
    }

    /// Cached candles for the interval's standard lookback, fetched once on a miss.
    pub async fn history(&self, symbol: &str, interval: Interval) -> Result<Vec<Candle>, CacheError> {
        let key = CacheKey::history(symbol, interval);
        let source = Arc::clone(&self.source);
        let symbol = symbol.to_string();
        self.store
            .get_or_fetch(&key, move || async move {
                source.fetch_history(&symbol, interval, interval.lookback_days()).await
            })
            .await
    }

    pub fn subscribe(&self, symbol: &str, interval: Interval) -> u32 {
        self.supervisor.subscribe(symbol, interval)
    }

    pub async fn unsubscribe(&self, symbol: &str, interval: Interval) -> u32 {
        self.supervisor.unsubscribe(symbol, interval).await
    }

    pub fn add_tick(&self, tick: Tick) {
        self.batcher.add_update(tick);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            session: self.store.session(),
            cache: self.store.stats(),
            refresh: self.supervisor.stats(),
            batching: self.batcher.stats(),
            inflight_fetches: self.store.inflight_count(),
        }
    }

    pub fn reset_stats(&self) {
        self.store.metrics().reset();
    }

    pub async fn invalidate(&self, scope: Invalidation) -> usize {
        self.store.invalidate(scope).await
    }

    pub async fn warm_now(&self) -> WarmReport {
        self.warming.warm_now().await
    }

    pub async fn snapshot_now(&self) -> Result<SnapshotRecord, CacheError> {
        self.snapshot.snapshot_now().await
    }
}
