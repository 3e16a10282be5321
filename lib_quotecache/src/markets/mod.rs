//! # Market Boundary Module
//!
//! Everything the cache layer consumes from the outside world about markets:
//!
//! - **`session`**: the `Clock` abstraction, the wall-clock `MarketClock` that
//!   classifies time into trading phases, and a `ManualClock` for tests.
//! - **`source`**: the `QuoteSource` trait and its data model (`Quote`,
//!   `Candle`, `Interval`, `Instrument`), plus the upstream timeout helper.

/// Market phase derivation and the `Clock` trait.
pub mod session;
/// Upstream quote provider trait and data model.
pub mod source;

pub use session::{Clock, ManualClock, MarketClock, MarketHours, MarketSession};
pub use source::{with_timeout, Candle, Instrument, Interval, Quote, QuoteSource};
