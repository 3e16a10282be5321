mod common;

use common::{open_clock, ScriptedSource};
use std::sync::Arc;

use chrono::NaiveTime;
use lib_quotecache::connections::MemoryBackend;
use lib_quotecache::ingestors::{Breadth, SnapshotScheduler, UniverseMember};
use lib_quotecache::markets::{Instrument, MarketHours};
use lib_quotecache::CacheStore;

fn hhmm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn scheduler(source: Arc<ScriptedSource>, universe: Vec<UniverseMember>) -> SnapshotScheduler {
    let store = CacheStore::new(Arc::new(MemoryBackend::new()), open_clock());
    SnapshotScheduler::new(
        store,
        source,
        MarketHours::default(),
        vec![hhmm(9, 0), hhmm(15, 45)],
        vec![Instrument::new("NIFTY", "NSE")],
        universe,
        8,
    )
}

#[tokio::test]
async fn partial_universe_still_produces_a_record() {
    let source = Arc::new(ScriptedSource::new(105.0));
    let universe: Vec<UniverseMember> =
        (0..30).map(|i| UniverseMember::new(format!("SYM{:02}", i), "NSE", "Misc")).collect();
    for i in [3, 7, 11, 19, 28] {
        source.fail_symbol(&format!("SYM{:02}", i));
    }

    let record = scheduler(source, universe).capture("15:45").await.unwrap();
    assert_eq!(record.universe_size, 30);
    assert_eq!(record.captured_count, 25);
    assert!(record.is_partial());
    assert_eq!(record.missing.len(), 5);
    assert!(record.missing.contains(&"SYM07:NSE".to_string()));
    assert_eq!(record.indices.len(), 1);
}

#[tokio::test]
async fn breadth_and_sector_averages() {
    let source = Arc::new(ScriptedSource::new(100.0));
    source.set_price("TCS", 110.0);
    source.set_price("INFY", 90.0);
    source.set_price("ITC", 104.0);
    let universe = vec![
        UniverseMember::new("TCS", "NSE", "IT"),
        UniverseMember::new("INFY", "NSE", "IT"),
        UniverseMember::new("ITC", "NSE", "Consumer"),
        UniverseMember::new("HUL", "NSE", "Consumer"),
    ];

    let record = scheduler(source, universe).capture("09:00").await.unwrap();
    assert!(!record.is_partial());
    assert_eq!(record.breadth, Breadth { advancing: 2, declining: 1, unchanged: 1 });
    assert!((record.sectors["IT"] - 0.0).abs() < 1e-9);
    assert!((record.sectors["Consumer"] - 2.0).abs() < 1e-9);
    assert_eq!(record.quotes["TCS:NSE"].price, 110.0);
}

#[tokio::test]
async fn records_are_immutable() {
    let source = Arc::new(ScriptedSource::new(100.0));
    let snapshots = scheduler(source.clone(), vec![UniverseMember::new("SBIN", "NSE", "Financials")]);

    let first = snapshots.capture("09:00").await.unwrap();
    let calls = source.quote_calls();

    source.set_price("SBIN", 250.0);
    let second = snapshots.capture("09:00").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(source.quote_calls(), calls);

    let later = snapshots.capture("15:45").await.unwrap();
    assert_eq!(later.quotes["SBIN:NSE"].price, 250.0);
}

#[tokio::test]
async fn every_instrument_failing_is_still_a_record() {
    let source = Arc::new(ScriptedSource::new(100.0));
    source.set_fail_all(true);
    let record = scheduler(source, vec![UniverseMember::new("SBIN", "NSE", "Financials")])
        .capture("09:00")
        .await
        .unwrap();
    assert_eq!(record.captured_count, 0);
    assert_eq!(record.missing, vec!["NIFTY:NSE".to_string(), "SBIN:NSE".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_captures_share_one_fetch() {
    let source = Arc::new(ScriptedSource::new(100.0).with_delay(std::time::Duration::from_millis(200)));
    let universe: Vec<UniverseMember> =
        (0..12).map(|i| UniverseMember::new(format!("SYM{:02}", i), "NSE", "Misc")).collect();
    let snapshots = scheduler(source.clone(), universe);

    let (first, second) = tokio::join!(snapshots.snapshot_now(), snapshots.snapshot_now());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);
    assert_eq!(first.captured_count, 12);
    // One index plus twelve members, fetched once.
    assert_eq!(source.quote_calls(), 13);
}

#[test]
fn triggers_render_as_weekday_cron_lines() {
    let snapshots = scheduler(Arc::new(ScriptedSource::new(1.0)), Vec::new());
    assert_eq!(snapshots.cron_expressions(), vec!["0 0 9 * * Mon-Fri", "0 45 15 * * Mon-Fri"]);
}
