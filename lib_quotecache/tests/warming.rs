mod common;

use async_trait::async_trait;
use common::{open_clock, quote_at, ScriptedSource};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lib_quotecache::cache::{CacheBackend, CacheEntry};
use lib_quotecache::connections::MemoryBackend;
use lib_quotecache::BackendError;
use lib_quotecache::ingestors::WarmingScheduler;
use lib_quotecache::markets::{Instrument, Interval, ManualClock, Quote};
use lib_quotecache::{CacheKey, CacheStore, CacheType};

fn nse(symbols: &[&str]) -> Vec<Instrument> {
    symbols.iter().map(|s| Instrument::new(*s, "NSE")).collect()
}

fn warmer(source: Arc<ScriptedSource>, clock: Arc<ManualClock>, watchlist: Vec<Instrument>) -> (WarmingScheduler, CacheStore) {
    let store = CacheStore::new(Arc::new(MemoryBackend::new()), clock);
    let warming = WarmingScheduler::new(
        store.clone(),
        source,
        watchlist,
        vec![CacheType::Quote, CacheType::History],
        Duration::from_secs(300),
        4,
    );
    (warming, store)
}

#[tokio::test]
async fn fresh_keys_are_skipped() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    let (warming, store) = warmer(source.clone(), open_clock(), Vec::new());
    store.set_with_policy(&CacheKey::quote("RELIANCE", "NSE"), &quote_at(2400.0, 2400.0)).await.unwrap();

    let report = warming.warm_all(&nse(&["RELIANCE", "TCS"]), &[CacheType::Quote]).await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.skipped_fresh, 1);
    assert_eq!(report.warmed, 1);
    assert!(report.is_clean());
    assert_eq!(source.quote_calls(), 1);

    // The pre-existing value was not overwritten.
    let q: Quote = store.get(&CacheKey::quote("RELIANCE", "NSE")).await.unwrap();
    assert_eq!(q.price, 2400.0);
}

#[tokio::test]
async fn failures_are_collected_and_the_pass_continues() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    source.fail_symbol("TCS");
    let (warming, store) = warmer(source.clone(), open_clock(), nse(&["RELIANCE", "TCS", "INFY"]));

    let report = warming.warm_now().await;
    assert_eq!(report.attempted, 6);
    assert_eq!(report.warmed, 4);
    let failed: Vec<&str> = report.failures.iter().map(|f| f.key.as_str()).collect();
    assert_eq!(failed, vec!["history:TCS:1d", "quote:TCS:NSE"]);

    assert!(store.contains_fresh(&CacheKey::quote("INFY", "NSE")).await);
    assert!(store.contains_fresh(&CacheKey::history("RELIANCE", Interval::Day1)).await);

    // A second pass only retries what is missing.
    let again = warming.warm_now().await;
    assert_eq!(again.skipped_fresh, 4);
    assert_eq!(again.failures.len(), 2);
}

#[tokio::test]
async fn unsupported_types_are_reported() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    let (warming, _) = warmer(source.clone(), open_clock(), Vec::new());

    let report = warming.warm_all(&nse(&["ITC"]), &[CacheType::Fundamentals]).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, "fundamentals:ITC:NSE");
    assert_eq!(source.quote_calls() + source.history_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn loop_warms_immediately_and_on_every_interval() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    let clock = open_clock();
    let (warming, _) = warmer(source.clone(), clock.clone(), nse(&["RELIANCE", "SBIN"]));
    let warming = Arc::new(warming);

    let cancel = CancellationToken::new();
    let task = {
        let warming = Arc::clone(&warming);
        let cancel = cancel.clone();
        tokio::spawn(async move { warming.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(source.quote_calls(), 2);
    assert_eq!(source.history_calls(), 2);

    // Let every entry expire before the next pass.
    clock.advance(Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.quote_calls(), 4);

    cancel.cancel();
    task.await.unwrap();
}

/// Hides each key on its first read, as if another writer landed just after it.
#[derive(Default)]
struct LateWriteBackend {
    inner: MemoryBackend,
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl CacheBackend for LateWriteBackend {
    fn name(&self) -> &'static str {
        "late-write"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        if self.seen.lock().unwrap().insert(key.to_string()) {
            return Ok(None);
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: CacheEntry, retain_for: Duration) -> Result<(), BackendError> {
        self.inner.set(key, entry, retain_for).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        self.inner.delete_prefix(prefix).await
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn key_filled_before_the_fetch_counts_as_skipped() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    let store = CacheStore::new(Arc::new(LateWriteBackend::default()), open_clock());
    store.set_with_policy(&CacheKey::quote("RELIANCE", "NSE"), &quote_at(2400.0, 2400.0)).await.unwrap();
    let warming = WarmingScheduler::new(
        store.clone(),
        source.clone(),
        Vec::new(),
        vec![CacheType::Quote],
        Duration::from_secs(300),
        4,
    );

    let report = warming.warm_all(&nse(&["RELIANCE"]), &[CacheType::Quote]).await;
    assert_eq!(report.skipped_fresh, 1);
    assert_eq!(report.warmed, 0);
    assert_eq!(source.quote_calls(), 0);
}

#[tokio::test]
async fn warming_loop_can_be_spawned_from_a_shared_handle() {
    let source = Arc::new(ScriptedSource::new(2500.0));
    let (warming, store) = warmer(source.clone(), open_clock(), nse(&["TCS"]));
    let warming = Arc::new(warming);

    let report = tokio::spawn({
        let warming = Arc::clone(&warming);
        async move { warming.warm_now().await }
    })
    .await
    .unwrap();
    assert_eq!(report.warmed, 2);
    assert!(store.contains_fresh(&CacheKey::quote("TCS", "NSE")).await);
}
