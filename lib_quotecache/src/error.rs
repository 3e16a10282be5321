//! # Error Taxonomy
//!
//! Three families of failure flow through the cache layer:
//!
//! - **`FetchError`**: an upstream quote source call failed or timed out. It is
//!   transient, never cached, and `Clone` so one single-flight outcome can be
//!   handed to every waiter.
//! - **`BackendError`**: the backing store could not be reached or returned an
//!   unreadable envelope. The store degrades to "always miss" instead of failing.
//! - **`CacheError`**: what public operations return, including configuration
//!   errors raised at startup.

use std::time::Duration;
use thiserror::Error;

/// Failure of a call into a `QuoteSource`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    #[error("upstream fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),

    #[error("instrument not found upstream: {0}")]
    NotFound(String),
}

/// Failure of the cache backend itself.
#[derive(Debug, Error)]
pub enum BackendError {
    #[cfg(feature = "connections")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored envelope is unreadable: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the public cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Upstream(#[from] FetchError),

    #[error("cache backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(feature = "scheduler")]
impl From<tokio_cron_scheduler::JobSchedulerError> for CacheError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        CacheError::Scheduler(e.to_string())
    }
}
