//! # Cache Keys
//!
//! Every key is built by a typed constructor so the writer and the reader of a
//! value cannot drift apart. Components are normalized (trimmed, upper-cased
//! where they name instruments) and joined with `:` behind a namespace that
//! maps to exactly one `CacheType`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::markets::Interval;

/// Category of cached data; decides the base TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheType {
    Indices,
    Highlights,
    Movers,
    Quote,
    Fundamentals,
    History,
    Snapshot,
    BatchQuotes,
    SectorData,
}

impl CacheType {
    pub const ALL: [CacheType; 9] = [
        CacheType::Indices,
        CacheType::Highlights,
        CacheType::Movers,
        CacheType::Quote,
        CacheType::Fundamentals,
        CacheType::History,
        CacheType::Snapshot,
        CacheType::BatchQuotes,
        CacheType::SectorData,
    ];

    /// Key namespace, also the config name.
    pub fn namespace(self) -> &'static str {
        match self {
            CacheType::Indices => "indices",
            CacheType::Highlights => "highlights",
            CacheType::Movers => "movers",
            CacheType::Quote => "quote",
            CacheType::Fundamentals => "fundamentals",
            CacheType::History => "history",
            CacheType::Snapshot => "snapshot",
            CacheType::BatchQuotes => "batchQuotes",
            CacheType::SectorData => "sectorData",
        }
    }

    /// Dense index used by per-type tables.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheType::ALL
            .into_iter()
            .find(|t| t.namespace().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown cache type '{}'", s))
    }
}

/// A fully rendered cache key together with the type it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cache_type: CacheType,
    rendered: String,
}

fn instrument_part(s: &str) -> String {
    s.trim().to_ascii_uppercase()
}

impl CacheKey {
    fn build(cache_type: CacheType, parts: &[&str]) -> Self {
        let mut rendered = String::from(cache_type.namespace());
        for part in parts {
            rendered.push(':');
            rendered.push_str(part);
        }
        Self { cache_type, rendered }
    }

    pub fn quote(symbol: &str, exchange: &str) -> Self {
        Self::build(CacheType::Quote, &[&instrument_part(symbol), &instrument_part(exchange)])
    }

    pub fn history(symbol: &str, interval: Interval) -> Self {
        Self::build(CacheType::History, &[&instrument_part(symbol), interval.as_str()])
    }

    pub fn indices() -> Self {
        Self::build(CacheType::Indices, &["all"])
    }

    pub fn highlights() -> Self {
        Self::build(CacheType::Highlights, &["all"])
    }

    /// Top movers of one kind, e.g. `gainers`, `losers`, `active`.
    pub fn movers(kind: &str) -> Self {
        Self::build(CacheType::Movers, &[&kind.trim().to_ascii_lowercase()])
    }

    pub fn fundamentals(symbol: &str) -> Self {
        Self::build(CacheType::Fundamentals, &[&instrument_part(symbol)])
    }

    /// `capture_time` is the trigger label, e.g. `09:00`.
    pub fn snapshot(date: NaiveDate, capture_time: &str) -> Self {
        Self::build(CacheType::Snapshot, &[&date.format("%Y-%m-%d").to_string(), capture_time.trim()])
    }

    /// Symbols are normalized, sorted and de-duplicated, so request order never changes the key.
    pub fn batch_quotes<S: AsRef<str>>(symbols: &[S]) -> Self {
        let mut normalized: Vec<String> = symbols.iter().map(|s| instrument_part(s.as_ref())).collect();
        normalized.sort();
        normalized.dedup();
        Self::build(CacheType::BatchQuotes, &[&normalized.join(",")])
    }

    pub fn sector_data(sector: &str) -> Self {
        Self::build(CacheType::SectorData, &[&sector.trim().to_ascii_lowercase()])
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl FromStr for CacheKey {
    type Err = String;

    /// Accepts an already rendered key (e.g. from an admin request); the
    /// namespace must name a known cache type.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (namespace, rest) = s.split_once(':').ok_or_else(|| format!("key '{}' has no namespace", s))?;
        if rest.is_empty() {
            return Err(format!("key '{}' has no identifier", s));
        }
        let cache_type: CacheType = namespace.parse()?;
        Ok(Self { cache_type, rendered: format!("{}:{}", cache_type.namespace(), rest) })
    }
}
