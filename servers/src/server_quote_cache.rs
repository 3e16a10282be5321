//! # Quote Cache Server
//!
//! Runs the `lib_quotecache` engine as a standalone process.
//!
//! ## Core Responsibilities:
//! - **Engine lifecycle:** builds the `CacheEngine` from layered configuration
//!   (defaults, JSON file, environment, CLI) and starts warming, batching, the
//!   janitor and snapshot triggers.
//! - **Market data:** a seeded random-walk `SyntheticQuoteSource` answers cache
//!   misses and a synthetic feed pushes ticks into the batcher.
//! - **Fan-out:** batches are published on a broadcast channel; a monitor task
//!   logs their sizes.
//! - **Admin surface:** `axum` routes for health, stats, invalidation, warming,
//!   snapshots and refresh subscriptions.
//! - **Shutdown:** Ctrl-C / SIGTERM stops the feed and the HTTP server, then
//!   the engine, which flushes one last batch.

#![forbid(unsafe_code)]

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lib_quotecache::CacheEngine;
use lib_quotecache::cache::CacheBackend;
use lib_quotecache::connections::{MemoryBackend, RedisBackend};
use lib_quotecache::core::BroadcastSink;
use lib_quotecache::markets::MarketClock;

mod quote_logic;
use quote_logic::{admin, config, logger, synthetic};

/// Broadcast slots per subscriber before a slow batch consumer starts lagging.
const BATCH_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // --- Phase 1: Configuration & Logging ---
    let config = config::load_config()?;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = logger::setup_logging(&log_dir, &log_level, config.log_retention.unwrap_or(7))?;
    info!(config_path = ?config.config_path, "configuration loaded");

    let engine_config = config.engine_config();
    let seed = config.seed.unwrap_or(42);

    // --- Phase 2: Collaborators ---
    let clock = Arc::new(MarketClock::new(engine_config.market_hours()?));
    let source = Arc::new(synthetic::SyntheticQuoteSource::new(seed));
    let backend: Arc<dyn CacheBackend> = match &config.redis_url {
        Some(url) => {
            let prefix = config.redis_prefix.as_deref().unwrap_or("quotecache");
            info!(prefix, "using redis cache backend");
            Arc::new(RedisBackend::connect(url, prefix).await?)
        }
        None => {
            info!("using in-process cache backend");
            Arc::new(MemoryBackend::new())
        }
    };
    let sink = Arc::new(BroadcastSink::new(BATCH_CHANNEL_CAPACITY));
    let batches = sink.subscribe();

    // --- Phase 3: Engine ---
    let engine = Arc::new(CacheEngine::new(engine_config, source, clock, backend, sink)?);
    engine.start().await?;

    // --- Phase 4: Feed, Monitor and Admin Surface ---
    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(monitor_batches(batches, cancel.clone()));
    let feed = tokio::spawn(synthetic::run_tick_feed(
        Arc::clone(&engine),
        config.tick_instruments.unwrap_or(200),
        config.tick_rate_hz.unwrap_or(2_000),
        seed,
        cancel.clone(),
    ));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(9010)));
    let server = tokio::spawn(admin::serve(addr, Arc::clone(&engine), cancel.clone()));

    // --- Phase 5: Shutdown ---
    shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();

    if let Err(e) = server.await? {
        warn!(error = %e, "admin surface exited with an error");
    }
    let _ = feed.await;
    engine.shutdown().await;
    let _ = monitor.await;

    info!("Shutdown complete.");
    Ok(())
}

/// Logs batch sizes until cancelled.
async fn monitor_batches(
    mut batches: tokio::sync::broadcast::Receiver<Arc<lib_quotecache::core::Batch>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = batches.recv() => match received {
                Ok(batch) => debug!(instruments = batch.len(), "batch delivered"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "batch monitor lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
