//! # Core Engine Module
//!
//! The live half of the engine: the components that run continuously beside
//! the cache rather than answering single reads.
//!
//! ## Core Components:
//!
//! - **`registry`**: the `RefreshSupervisor`. Reference-counted background
//!   refresh per `(symbol, interval)`; the first subscriber starts a loop and
//!   the last unsubscriber stops it, so idle pairs cost nothing.
//!
//! - **`dispatcher`**: the `TickBuffer` and `BatchScheduler`. Producers
//!   overwrite the latest tick per instrument and a fixed-interval loop hands
//!   each window's batch to a `BatchSink`.

#![forbid(unsafe_code)]

/// Reference-counted background refresh loops.
pub mod registry;
/// Tick coalescing and fixed-interval batch delivery.
pub mod dispatcher;

pub use dispatcher::{Batch, BatchScheduler, BatchSink, BatchStats, BroadcastSink, InstrumentToken, Tick, TickBuffer};
pub use registry::{RefreshSupervisor, SubscriptionKey, SupervisorStats};
