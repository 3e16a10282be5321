mod common;

use common::{open_clock, ScriptedSource};
use std::sync::Arc;
use std::time::Duration;

use lib_quotecache::connections::MemoryBackend;
use lib_quotecache::core::{RefreshSupervisor, SupervisorStats};
use lib_quotecache::markets::{Candle, Interval};
use lib_quotecache::{CacheKey, CacheStore};

fn supervisor(source: Arc<ScriptedSource>) -> (RefreshSupervisor, CacheStore) {
    let store = CacheStore::new(Arc::new(MemoryBackend::new()), open_clock());
    (RefreshSupervisor::new(store.clone(), source), store)
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_stops_the_loop() {
    let (sup, _) = supervisor(Arc::new(ScriptedSource::new(1500.0)));

    assert_eq!(sup.subscribe("INFY", Interval::Minute5), 1);
    assert_eq!(sup.subscribe("infy", Interval::Minute5), 2);
    assert_eq!(sup.stats().loops_started, 1);

    assert_eq!(sup.unsubscribe("INFY", Interval::Minute5).await, 1);
    assert!(sup.is_active("INFY", Interval::Minute5));

    assert_eq!(sup.unsubscribe("INFY", Interval::Minute5).await, 0);
    let stats = sup.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.loops_started, 1);
    assert_eq!(stats.loops_stopped, 1);

    // Unknown pairs are a no-op.
    assert_eq!(sup.unsubscribe("INFY", Interval::Minute5).await, 0);
    assert_eq!(sup.stats().loops_stopped, 1);
}

#[tokio::test(start_paused = true)]
async fn loop_rewrites_history_every_half_ttl() {
    let source = Arc::new(ScriptedSource::new(1500.0));
    let (sup, store) = supervisor(source.clone());
    sup.subscribe("INFY", Interval::Day1);

    // History base TTL is 300 s in an open session, so the cadence is 150 s.
    tokio::time::sleep(Duration::from_secs(149)).await;
    assert_eq!(source.history_calls(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(source.history_calls(), 1);
    let candles: Vec<Candle> = store.get(&CacheKey::history("INFY", Interval::Day1)).await.unwrap();
    assert!(!candles.is_empty());

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(source.history_calls(), 2);
    assert_eq!(sup.stats().refresh_ok, 2);

    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_cycles_do_not_end_the_loop() {
    let source = Arc::new(ScriptedSource::new(1500.0));
    source.set_fail_all(true);
    let (sup, store) = supervisor(source.clone());
    sup.subscribe("TCS", Interval::Hour1);

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(sup.stats().refresh_failed, 2);
    assert!(sup.is_active("TCS", Interval::Hour1));
    assert!(store.get::<Vec<Candle>>(&CacheKey::history("TCS", Interval::Hour1)).await.is_none());

    source.set_fail_all(false);
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(sup.stats().refresh_ok, 1);
    assert!(store.get::<Vec<Candle>>(&CacheKey::history("TCS", Interval::Hour1)).await.is_some());

    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribers_balance_out() {
    let source = Arc::new(ScriptedSource::new(1500.0));
    let (sup, _) = supervisor(source);
    let sup = Arc::new(sup);

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                let interval = if i % 2 == 0 { Interval::Minute1 } else { Interval::Minute15 };
                sup.subscribe("HDFCBANK", interval);
                tokio::task::yield_now().await;
                sup.unsubscribe("HDFCBANK", interval).await;
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let stats = sup.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.loops_started, stats.loops_stopped);
    assert_eq!(sup.ref_count("HDFCBANK", Interval::Minute1), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_loop() {
    let (sup, _) = supervisor(Arc::new(ScriptedSource::new(1500.0)));
    sup.subscribe("RELIANCE", Interval::Minute1);
    sup.subscribe("RELIANCE", Interval::Day1);
    sup.subscribe("TCS", Interval::Minute5);
    sup.subscribe("TCS", Interval::Minute5);
    assert_eq!(sup.active_keys().len(), 3);

    sup.shutdown().await;
    assert_eq!(
        sup.stats(),
        SupervisorStats { active: 0, loops_started: 3, loops_stopped: 3, refresh_ok: 0, refresh_failed: 0 }
    );
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_mid_refresh_leaves_nothing_in_flight() {
    let source = Arc::new(ScriptedSource::new(1500.0).with_delay(Duration::from_secs(5)));
    let (sup, store) = supervisor(source.clone());
    sup.subscribe("INFY", Interval::Day1);

    tokio::time::sleep(Duration::from_secs(151)).await;
    assert_eq!(source.history_calls(), 1);
    assert_eq!(store.inflight_count(), 1);

    assert_eq!(sup.unsubscribe("INFY", Interval::Day1).await, 0);
    assert_eq!(sup.stats().loops_stopped, 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(store.inflight_count(), 0);
    assert_eq!(source.history_calls(), 1);
}
