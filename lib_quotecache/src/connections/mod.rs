//! # Connections Module
//!
//! Storage backends the cache store can sit on.

/// Process-local map backend.
pub mod memory;

/// Module for Redis cache operations and connection handling.
#[cfg(feature = "connections")]
pub mod cache_redis;

pub use memory::MemoryBackend;
#[cfg(feature = "connections")]
pub use cache_redis::RedisBackend;
