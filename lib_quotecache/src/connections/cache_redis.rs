//! # Redis Cache Backend
//!
//! Stores each entry as a JSON envelope under `{prefix}:{key}` with a native
//! `PX` expiry of TTL + stale grace, so Redis itself reclaims dead entries.
//! Freshness is still judged by the store from the envelope's `storedAt`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use crate::cache::backend::{CacheBackend, CacheEntry};
use crate::error::BackendError;

/// Keys deleted per `SCAN` page during namespace invalidation.
const SCAN_PAGE: usize = 500;

/// A handler for Redis cache interactions.
#[derive(Clone)]
pub struct RedisBackend {
    /// Multiplexed, auto-reconnecting connection.
    conn: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `prefix` - Key prefix isolating this process's entries.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, BackendError> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, prefix: prefix.trim_end_matches(':').to_string() })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Deletes everything matching a glob pattern, one SCAN page at a time.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let n: usize = conn.del(&keys).await?;
                removed += n;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.full_key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, retain_for: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&entry)?;
        let millis = retain_for.as_millis().clamp(1, u64::MAX as u128) as u64;
        let _: () = conn.pset_ex(self.full_key(key), json, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(self.full_key(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        self.delete_matching(&format!("{}*", self.full_key(prefix))).await
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        self.delete_matching(&format!("{}:*", self.prefix)).await
    }
}
