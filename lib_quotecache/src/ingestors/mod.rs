//! # Scheduled Ingestors Module
//!
//! Self-scheduling jobs that pull from the `QuoteSource` on their own clock
//! rather than in response to a consumer read.
//!
//! ## Contained Modules:
//! - **`warming`**: periodic pre-population of a fixed watch-list so the first
//!   read of a popular instrument is a hit.
//! - **`snapshot`**: wall-clock triggered capture of a market-wide snapshot
//!   (indices, universe quotes, breadth, sector averages).

#![forbid(unsafe_code)]

/// Watch-list warming loop.
pub mod warming;
/// Daily market snapshot capture.
pub mod snapshot;

pub use snapshot::{Breadth, SnapshotRecord, SnapshotScheduler, UniverseMember};
pub use warming::{WarmFailure, WarmReport, WarmingScheduler};
