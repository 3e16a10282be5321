//! # In-Process Cache Backend
//!
//! A mutex-guarded map. Every operation holds the lock only for the map
//! access itself, so readers never wait on anything slower than a lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cache::backend::{CacheBackend, CacheEntry};
use crate::error::BackendError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of physically retained entries, fresh or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry, _retain_for: Duration) -> Result<(), BackendError> {
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize, BackendError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.age(now) <= e.ttl + grace);
        Ok(before - entries.len())
    }
}
