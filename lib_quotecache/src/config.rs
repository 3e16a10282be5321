//! # Engine Configuration
//!
//! Everything a `CacheEngine` needs that is not an injected collaborator.
//! The struct deserializes from camelCase JSON with every field optional, so
//! a config file only has to name what it changes. `validate()` is the single
//! gate for configuration errors; it runs at startup and a failure there is
//! fatal rather than something to recover from at runtime.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cache::{CacheType, ExpiryPolicy, StoreOptions};
use crate::error::CacheError;
use crate::ingestors::UniverseMember;
use crate::markets::session::parse_hhmm;
use crate::markets::{Instrument, MarketHours};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketConfig {
    /// IANA timezone name of the exchange.
    pub timezone: String,
    pub pre_open: String,
    pub open: String,
    pub close: String,
    /// Exchange holidays as `YYYY-MM-DD`.
    pub holidays: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            pre_open: "09:00".to_string(),
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotConfig {
    /// Exchange-local capture times, `HH:MM`.
    pub triggers: Vec<String>,
    pub indices: Vec<Instrument>,
    pub universe: Vec<UniverseMember>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let member = |s: &str, sector: &str| UniverseMember::new(s, "NSE", sector);
        Self {
            triggers: vec!["09:00".to_string(), "15:45".to_string()],
            indices: vec![Instrument::new("NIFTY", "NSE"), Instrument::new("BANKNIFTY", "NSE")],
            universe: vec![
                member("RELIANCE", "Energy"),
                member("ONGC", "Energy"),
                member("TCS", "IT"),
                member("INFY", "IT"),
                member("WIPRO", "IT"),
                member("HDFCBANK", "Financials"),
                member("ICICIBANK", "Financials"),
                member("SBIN", "Financials"),
                member("HINDUNILVR", "Consumer"),
                member("ITC", "Consumer"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub fetch_timeout_ms: u64,
    pub stale_grace_secs: u64,
    pub janitor_interval_secs: u64,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub warm_interval_secs: u64,
    pub warm_concurrency: usize,
    pub snapshot_concurrency: usize,
    /// Base TTL overrides in seconds, keyed by cache type name.
    pub ttl_overrides: HashMap<String, u64>,
    pub market: MarketConfig,
    pub watchlist: Vec<Instrument>,
    /// Cache type names warmed for each watch-list instrument.
    pub warm_types: Vec<String>,
    pub snapshot: SnapshotConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 12_000,
            stale_grace_secs: 300,
            janitor_interval_secs: 60,
            batch_interval_ms: 100,
            max_batch_size: 5_000,
            warm_interval_secs: 300,
            warm_concurrency: 8,
            snapshot_concurrency: 8,
            ttl_overrides: HashMap::new(),
            market: MarketConfig::default(),
            watchlist: ["RELIANCE", "TCS", "HDFCBANK", "INFY", "ICICIBANK"]
                .into_iter()
                .map(|s| Instrument::new(s, "NSE"))
                .collect(),
            warm_types: vec!["quote".to_string(), "history".to_string()],
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::Configuration(format!("invalid engine config: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self, CacheError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Checks every derived value. Call once at startup.
    pub fn validate(&self) -> Result<(), CacheError> {
        let positive = [
            ("fetchTimeoutMs", self.fetch_timeout_ms),
            ("janitorIntervalSecs", self.janitor_interval_secs),
            ("batchIntervalMs", self.batch_interval_ms),
            ("warmIntervalSecs", self.warm_interval_secs),
            ("maxBatchSize", self.max_batch_size as u64),
            ("warmConcurrency", self.warm_concurrency as u64),
            ("snapshotConcurrency", self.snapshot_concurrency as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(CacheError::Configuration(format!("{} must be greater than zero", name)));
        }

        self.policy()?;
        self.market_hours()?;
        self.warm_cache_types()?;
        self.snapshot_triggers()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<ExpiryPolicy, CacheError> {
        ExpiryPolicy::with_overrides(&self.ttl_overrides)
    }

    pub fn market_hours(&self) -> Result<MarketHours, CacheError> {
        let m = &self.market;
        MarketHours::parse(&m.timezone, &m.pre_open, &m.open, &m.close, &m.holidays)
    }

    pub fn warm_cache_types(&self) -> Result<Vec<CacheType>, CacheError> {
        self.warm_types
            .iter()
            .map(|name| name.parse::<CacheType>().map_err(CacheError::Configuration))
            .collect()
    }

    pub fn snapshot_triggers(&self) -> Result<Vec<NaiveTime>, CacheError> {
        let mut triggers = self.snapshot.triggers.iter().map(|t| parse_hhmm(t)).collect::<Result<Vec<_>, _>>()?;
        triggers.sort();
        triggers.dedup();
        Ok(triggers)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            stale_grace: Duration::from_secs(self.stale_grace_secs),
        }
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_interval(), Duration::from_millis(100));
        assert_eq!(config.warm_cache_types().unwrap(), vec![CacheType::Quote, CacheType::History]);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"batchIntervalMs": 250, "market": {"close": "15:00"}}"#).unwrap();
        assert_eq!(config.batch_interval_ms, 250);
        assert_eq!(config.market.close, "15:00");
        assert_eq!(config.market.open, "09:15");
        assert_eq!(config.max_batch_size, 5_000);
    }

    #[test]
    fn rejects_unknown_cache_type() {
        let mut config = EngineConfig::default();
        config.ttl_overrides.insert("tickers".to_string(), 10);
        assert!(matches!(config.validate(), Err(CacheError::Configuration(_))));

        let mut config = EngineConfig::default();
        config.warm_types.push("tickers".to_string());
        assert!(matches!(config.validate(), Err(CacheError::Configuration(_))));
    }

    #[test]
    fn rejects_zero_values_and_bad_times() {
        let config = EngineConfig { batch_interval_ms: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.ttl_overrides.insert("quote".to_string(), 0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.market.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.snapshot.triggers = vec!["25:00".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn triggers_are_sorted_and_deduplicated() {
        let mut config = EngineConfig::default();
        config.snapshot.triggers = vec!["15:45".to_string(), "09:00".to_string(), "15:45".to_string()];
        let triggers = config.snapshot_triggers().unwrap();
        assert_eq!(triggers.len(), 2);
        assert!(triggers[0] < triggers[1]);
    }
}
