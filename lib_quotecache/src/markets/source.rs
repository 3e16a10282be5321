//! # Upstream Quote Source
//!
//! The boundary to whatever actually produces market data (a broker API, an
//! exchange feed, a replay file). The cache layer only ever talks to this
//! trait, and always through `with_timeout` so a hung upstream cannot pin a
//! caller or a background loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FetchError;

/// Last traded price plus the day's OHLC context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: u64,
    pub prev_close: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Percentage change against the previous close. Zero when there is no previous close.
    pub fn change_pct(&self) -> f64 {
        if self.prev_close == 0.0 {
            0.0
        } else {
            (self.price - self.prev_close) / self.prev_close * 100.0
        }
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: u64,
}

/// A tradable instrument on a specific exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: String,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), exchange: exchange.into() }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.exchange)
    }
}

/// Candle interval for history requests and refresh subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Hour1 => "1h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1w",
        }
    }

    /// Days of history requested for this interval.
    pub fn lookback_days(self) -> u32 {
        match self {
            Interval::Minute1 => 1,
            Interval::Minute5 => 5,
            Interval::Minute15 => 15,
            Interval::Hour1 => 60,
            Interval::Day1 => 365,
            Interval::Week1 => 1825,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" | "minute" => Ok(Interval::Minute1),
            "5m" | "5min" => Ok(Interval::Minute5),
            "15m" | "15min" => Ok(Interval::Minute15),
            "1h" | "60m" | "hour" => Ok(Interval::Hour1),
            "1d" | "day" | "daily" => Ok(Interval::Day1),
            "1w" | "week" | "weekly" => Ok(Interval::Week1),
            other => Err(format!("unknown interval '{}'", other)),
        }
    }
}

/// Upstream market data provider.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, FetchError>;

    async fn fetch_history(&self, symbol: &str, interval: Interval, days: u32) -> Result<Vec<Candle>, FetchError>;
}

/// Bounds an upstream call; an elapsed timer is reported as `FetchError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(outcome) => outcome,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}
