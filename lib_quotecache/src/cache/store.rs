//! # Cache Store
//!
//! The one owner of cached entries. Values are JSON-encoded envelopes in a
//! pluggable `CacheBackend`; freshness is judged here against the injected
//! `Clock`, and TTLs come from the `ExpiryPolicy` for the session current at
//! write time.
//!
//! ## Single-flight
//! `get_or_fetch`, `populate` and `refresh` funnel through one in-flight table
//! keyed by the rendered cache key. The first caller for a missing key becomes
//! the leader and installs a shared future; every concurrent caller for the
//! same key awaits that future instead of calling upstream again, and all of
//! them observe the same payload or the same `FetchError`. The leader runs as
//! its own task, so it finishes, stores and removes its table entry even when
//! every caller waiting on it has been dropped. A failed fetch is never cached
//! and the next read retries immediately.
//!
//! ## Degradation
//! Backend failures never surface to readers: a failed read is a miss, a
//! failed write is dropped, and both bump the error counter of the key's type.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::backend::{CacheBackend, CacheEntry};
use crate::cache::key::{CacheKey, CacheType};
use crate::cache::metrics::{CacheMetrics, StatsReport};
use crate::cache::policy::ExpiryPolicy;
use crate::error::{CacheError, FetchError};
use crate::markets::{with_timeout, Clock, MarketSession};

/// Payload produced by one shared fetch.
#[derive(Debug, Clone)]
struct Fetched {
    payload: Arc<str>,
    /// False when the leader found the key already fresh and skipped upstream.
    upstream: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fetched, FetchError>>>;

/// Removes the in-flight entry when the leader finishes, panics included.
struct InflightSlot<'a> {
    store: &'a CacheStore,
    key: &'a str,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.store.lock_inflight().remove(self.key);
    }
}

/// How a read treats expired entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Expired entries are absent.
    #[default]
    Fresh,
    /// Expired entries still physically retained are returned, flagged stale.
    AllowStale,
}

/// A value read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    pub stale: bool,
}

/// Scope of an explicit invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(CacheKey),
    Namespace(CacheType),
    Prefix(String),
    All,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on every upstream call made through the store.
    pub fetch_timeout: Duration,
    /// How long expired entries stay readable in `ReadMode::AllowStale`.
    pub stale_grace: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { fetch_timeout: Duration::from_secs(12), stale_grace: Duration::from_secs(300) }
    }
}

struct StoreInner {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    metrics: Arc<CacheMetrics>,
    options: StoreOptions,
    inflight: Mutex<HashMap<String, SharedFetch>>,
}

/// Cheaply cloneable handle; clones share the same entries and in-flight table.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Store with the default policy, fresh metrics and default options.
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(
            backend,
            clock,
            ExpiryPolicy::default(),
            Arc::new(CacheMetrics::new()),
            StoreOptions::default(),
        )
    }

    pub fn with_parts(
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        policy: ExpiryPolicy,
        metrics: Arc<CacheMetrics>,
        options: StoreOptions,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                clock,
                policy,
                metrics,
                options,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> &ExpiryPolicy {
        &self.inner.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.inner.metrics
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> StatsReport {
        self.inner.metrics.report()
    }

    pub fn session(&self) -> MarketSession {
        self.inner.clock.market_session()
    }

    /// TTL a write of this type would get right now.
    pub fn ttl_for(&self, cache_type: CacheType) -> Duration {
        self.inner.policy.ttl(cache_type, self.session())
    }

    /// Number of fetches currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.lock_inflight().len()
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, SharedFetch>> {
        self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.inner.backend.get(key.as_str()).await {
            Ok(entry) => entry,
            Err(e) => {
                self.inner.metrics.record_error(key.cache_type());
                warn!(key = %key, backend = self.inner.backend.name(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write_payload(&self, key: &CacheKey, payload: String, ttl: Duration) {
        let entry = CacheEntry { payload, stored_at: self.inner.clock.now(), ttl };
        let retain_for = ttl + self.inner.options.stale_grace;
        if let Err(e) = self.inner.backend.set(key.as_str(), entry, retain_for).await {
            self.inner.metrics.record_error(key.cache_type());
            warn!(key = %key, backend = self.inner.backend.name(), error = %e, "cache write dropped");
        }
    }

    /// Fresh value for `key`, if any. Counts a hit or a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get_with(key, ReadMode::Fresh).await.map(|c| c.value)
    }

    /// Read with an explicit mode. A stale value counts as a miss.
    pub async fn get_with<T: DeserializeOwned>(&self, key: &CacheKey, mode: ReadMode) -> Option<Cached<T>> {
        let cache_type = key.cache_type();
        let now = self.inner.clock.now();

        let found = match self.read_entry(key).await {
            Some(entry) if !entry.is_expired(now) => Some((entry, false)),
            Some(entry) if mode == ReadMode::AllowStale => Some((entry, true)),
            _ => None,
        };

        let Some((entry, stale)) = found else {
            self.inner.metrics.record_miss(cache_type);
            return None;
        };

        match serde_json::from_str::<T>(&entry.payload) {
            Ok(value) => {
                if stale {
                    self.inner.metrics.record_miss(cache_type);
                } else {
                    self.inner.metrics.record_hit(cache_type);
                }
                Some(Cached { value, stored_at: entry.stored_at, stale })
            }
            Err(e) => {
                self.inner.metrics.record_error(cache_type);
                self.inner.metrics.record_miss(cache_type);
                warn!(key = %key, error = %e, "cached payload does not decode as requested type");
                None
            }
        }
    }

    /// True if a fresh entry exists. Does not touch the metrics.
    pub async fn contains_fresh(&self, key: &CacheKey) -> bool {
        let now = self.inner.clock.now();
        self.read_entry(key).await.is_some_and(|e| !e.is_expired(now))
    }

    /// Overwrites `key` with an explicit TTL.
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.write_payload(key, payload, ttl).await;
        Ok(())
    }

    /// Overwrites `key` with the policy TTL for the current session.
    pub async fn set_with_policy<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        self.set(key, value, self.ttl_for(key.cache_type())).await
    }

    /// Removes one key. Deleting an absent key is not an error.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        match self.inner.backend.delete(key.as_str()).await {
            Ok(removed) => removed,
            Err(e) => {
                self.inner.metrics.record_error(key.cache_type());
                warn!(key = %key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Removes every key of one cache type.
    pub async fn delete_namespace(&self, cache_type: CacheType) -> usize {
        let prefix = format!("{}:", cache_type.namespace());
        match self.inner.backend.delete_prefix(&prefix).await {
            Ok(n) => n,
            Err(e) => {
                self.inner.metrics.record_error(cache_type);
                warn!(namespace = %cache_type, error = %e, "namespace invalidation failed");
                0
            }
        }
    }

    /// Applies an invalidation; returns how many entries were removed.
    pub async fn invalidate(&self, scope: Invalidation) -> usize {
        let removed = match &scope {
            Invalidation::Key(key) => usize::from(self.delete(key).await),
            Invalidation::Namespace(t) => self.delete_namespace(*t).await,
            Invalidation::Prefix(prefix) => match self.inner.backend.delete_prefix(prefix).await {
                Ok(n) => n,
                Err(e) => {
                    let namespace = prefix.split(':').next().and_then(|ns| ns.parse::<CacheType>().ok());
                    match namespace {
                        Some(t) => self.inner.metrics.record_error(t),
                        None => self.inner.metrics.record_unscoped_error(),
                    }
                    warn!(prefix = %prefix, error = %e, "prefix invalidation failed");
                    0
                }
            },
            Invalidation::All => match self.inner.backend.clear().await {
                Ok(n) => n,
                Err(e) => {
                    self.inner.metrics.record_unscoped_error();
                    warn!(error = %e, "cache clear failed");
                    0
                }
            },
        };
        info!(scope = ?scope, removed, "cache invalidated");
        removed
    }

    /// Cached value on a fresh hit; otherwise one de-duplicated upstream
    /// fetch whose result is stored with the policy TTL. Fetch failures are
    /// returned and nothing is cached.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.get_or_fetch_within(key, self.inner.options.fetch_timeout, fetch).await
    }

    /// `get_or_fetch` with an explicit time limit for the fetch, for
    /// composite fetches that make several bounded upstream calls.
    pub async fn get_or_fetch_within<T, F, Fut>(&self, key: &CacheKey, limit: Duration, fetch: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let fetched = self.fetch_shared(key, fetch, true, limit).await?;
        Ok(serde_json::from_str(&fetched.payload)?)
    }

    /// Like `get_or_fetch` but silent on metrics; used for warming. Returns
    /// whether upstream was called, `false` when the key turned out fresh.
    pub async fn populate<T, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<bool, CacheError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetched = self.fetch_shared(key, fetch, true, self.inner.options.fetch_timeout).await?;
        Ok(fetched.upstream)
    }

    /// Fetches and overwrites regardless of the current entry; used by
    /// background refresh. Still joins an in-flight fetch for the same key.
    pub async fn refresh<T, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<(), CacheError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.fetch_shared(key, fetch, false, self.inner.options.fetch_timeout).await?;
        Ok(())
    }

    async fn fetch_shared<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        skip_if_fresh: bool,
        limit: Duration,
    ) -> Result<Fetched, FetchError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.lock_inflight();
            match inflight.get(key.as_str()) {
                Some(existing) => {
                    debug!(key = %key, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let store = self.clone();
                    let owned_key = key.clone();
                    let task =
                        tokio::spawn(async move { store.lead_fetch(&owned_key, fetch, skip_if_fresh, limit).await });
                    let leader = async move {
                        task.await
                            .unwrap_or_else(|e| Err(FetchError::Upstream(format!("fetch task ended abnormally: {}", e))))
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.as_str().to_string(), leader.clone());
                    leader
                }
            }
        };
        shared.await
    }

    async fn lead_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        skip_if_fresh: bool,
        limit: Duration,
    ) -> Result<Fetched, FetchError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let _slot = InflightSlot { store: self, key: key.as_str() };
        self.fetch_and_store(key, fetch, skip_if_fresh, limit).await
    }

    async fn fetch_and_store<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        skip_if_fresh: bool,
        limit: Duration,
    ) -> Result<Fetched, FetchError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        // A previous leader may have stored the value between our miss and now.
        if skip_if_fresh {
            let now = self.inner.clock.now();
            if let Some(entry) = self.read_entry(key).await {
                if !entry.is_expired(now) {
                    return Ok(Fetched { payload: Arc::from(entry.payload), upstream: false });
                }
            }
        }

        let cache_type = key.cache_type();
        match with_timeout(limit, fetch()).await {
            Ok(value) => {
                let payload = serde_json::to_string(&value).map_err(|e| FetchError::Decode(e.to_string()))?;
                let ttl = self.ttl_for(cache_type);
                self.write_payload(key, payload.clone(), ttl).await;
                debug!(key = %key, ttl_secs = ttl.as_secs(), "fetched and cached");
                Ok(Fetched { payload: Arc::from(payload), upstream: true })
            }
            Err(e) => {
                self.inner.metrics.record_error(cache_type);
                warn!(key = %key, error = %e, "upstream fetch failed");
                Err(e)
            }
        }
    }

    /// Drops entries past TTL + stale grace from backends without native expiry.
    pub async fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        match self.inner.backend.purge_expired(now, self.inner.options.stale_grace).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "expired entry purge failed");
                0
            }
        }
    }

    /// Spawns a periodic purge task that exits when `cancel` fires.
    pub fn spawn_janitor(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = store.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "janitor purged expired entries");
                        }
                    }
                }
            }
        })
    }
}
