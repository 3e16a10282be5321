//! # Backend Seam
//!
//! The storage contract the `CacheStore` sits on. A backend only stores and
//! returns envelopes; freshness is decided by the store against its `Clock`,
//! so an in-process map and a networked cache behave identically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BackendError;

/// A stored value with the metadata needed to judge its freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// JSON-encoded value.
    pub payload: String,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Time since the entry was written; zero if `now` precedes `stored_at`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Expired once strictly older than its TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError>;

    /// Overwrites unconditionally. `retain_for` is how long the backend should
    /// physically keep the entry (TTL plus the stale grace window).
    async fn set(&self, key: &str, entry: CacheEntry, retain_for: Duration) -> Result<(), BackendError>;

    /// Returns whether something was removed. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Removes every key starting with `prefix`; returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError>;

    async fn clear(&self) -> Result<usize, BackendError>;

    /// Drops entries older than TTL + `grace`. Backends with native expiry can keep the default.
    async fn purge_expired(&self, _now: DateTime<Utc>, _grace: Duration) -> Result<usize, BackendError> {
        Ok(0)
    }
}
