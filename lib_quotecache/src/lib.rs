//! # lib_quotecache
//!
//! Session-adaptive market data cache for the `rsdev` servers.
//!
//! - **`cache`**: typed keys, the TTL policy, metrics and the single-flight `CacheStore`.
//! - **`connections`**: storage backends (in-memory, and Redis behind `connections`).
//! - **`core`**: reference-counted background refresh and tick batching.
//! - **`ingestors`**: watch-list warming and daily market snapshots.
//! - **`markets`**: the `QuoteSource` and `Clock` boundaries plus market hours.
//! - **`engine`**: the `CacheEngine` facade that wires everything from an `EngineConfig`.

pub mod cache;
pub mod config;
pub mod connections;
pub mod core;
pub mod engine;
pub mod error;
pub mod ingestors;
pub mod markets;

pub use cache::{CacheKey, CacheStore, CacheType, ExpiryPolicy, Invalidation, ReadMode};
pub use config::EngineConfig;
pub use engine::{CacheEngine, EngineStats};
pub use error::{BackendError, CacheError, FetchError};
