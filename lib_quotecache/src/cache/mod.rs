//! # Cache Module
//!
//! The storage half of the engine:
//!
//! - **`key`**: `CacheType` and the typed `CacheKey` constructors.
//! - **`policy`**: the session-adaptive `ExpiryPolicy`.
//! - **`backend`**: the `CacheBackend` trait and the stored `CacheEntry` envelope.
//! - **`metrics`**: per-type hit/miss/error counters.
//! - **`store`**: the `CacheStore`, including single-flight `get_or_fetch`.

pub mod backend;
pub mod key;
pub mod metrics;
pub mod policy;
pub mod store;

pub use backend::{CacheBackend, CacheEntry};
pub use key::{CacheKey, CacheType};
pub use metrics::{CacheMetrics, StatsReport, TypeStats};
pub use policy::ExpiryPolicy;
pub use store::{CacheStore, Cached, Invalidation, ReadMode, StoreOptions};
