//! # Expiry Policy
//!
//! Pure `(CacheType, MarketSession) -> TTL` mapping. The base table is the
//! open-market TTL; closed and pre-market sessions stretch it because the
//! underlying data moves far less while the exchange is shut.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::key::CacheType;
use crate::error::CacheError;
use crate::markets::MarketSession;

/// TTL applied to indices, movers and highlights while the market is closed.
const CLOSED_SUMMARY_TTL_SECS: u64 = 3600;
/// TTL applied to single quotes while the market is closed.
const CLOSED_QUOTE_TTL_SECS: u64 = 1800;
const CLOSED_MULTIPLIER: u64 = 3;
const PRE_MARKET_MULTIPLIER: u64 = 2;

/// Session-adaptive TTL table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryPolicy {
    base_secs: [u64; 9],
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        let mut base_secs = [0u64; 9];
        for t in CacheType::ALL {
            base_secs[t.index()] = match t {
                CacheType::Indices => 30,
                CacheType::Highlights => 300,
                CacheType::Movers => 300,
                CacheType::Quote => 30,
                CacheType::Fundamentals => 86_400,
                CacheType::History => 300,
                CacheType::Snapshot => 604_800,
                CacheType::BatchQuotes => 60,
                CacheType::SectorData => 600,
            };
        }
        Self { base_secs }
    }
}

impl ExpiryPolicy {
    /// Applies base-TTL overrides keyed by cache type name.
    ///
    /// Rejects unknown names, zero TTLs, and tables that break the relative
    /// ordering the defaults encode (live data <= summaries <= reference data).
    pub fn with_overrides(overrides: &HashMap<String, u64>) -> Result<Self, CacheError> {
        let mut policy = Self::default();
        for (name, secs) in overrides {
            let cache_type: CacheType = name.parse().map_err(CacheError::Configuration)?;
            if *secs == 0 {
                return Err(CacheError::Configuration(format!("TTL for '{}' must be positive", name)));
            }
            policy.base_secs[cache_type.index()] = *secs;
        }
        policy.check_ordering()?;
        Ok(policy)
    }

    fn check_ordering(&self) -> Result<(), CacheError> {
        use CacheType::*;
        // Each pair reads "left must not outlive right".
        let constraints = [
            (Quote, BatchQuotes),
            (Indices, BatchQuotes),
            (BatchQuotes, Highlights),
            (BatchQuotes, Movers),
            (Highlights, SectorData),
            (Movers, SectorData),
            (SectorData, Fundamentals),
            (History, Fundamentals),
            (Fundamentals, Snapshot),
        ];
        for (shorter, longer) in constraints {
            if self.base(shorter) > self.base(longer) {
                return Err(CacheError::Configuration(format!(
                    "base TTL of '{}' ({}s) must not exceed '{}' ({}s)",
                    shorter,
                    self.base(shorter).as_secs(),
                    longer,
                    self.base(longer).as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Open-market TTL of a type.
    pub fn base(&self, cache_type: CacheType) -> Duration {
        Duration::from_secs(self.base_secs[cache_type.index()])
    }

    /// TTL for a type in a given session.
    pub fn ttl(&self, cache_type: CacheType, session: MarketSession) -> Duration {
        let base = self.base_secs[cache_type.index()];
        let secs = match session {
            MarketSession::Open => base,
            MarketSession::PreMarket => base * PRE_MARKET_MULTIPLIER,
            MarketSession::Closed | MarketSession::ClosedWeekend => match cache_type {
                CacheType::Indices | CacheType::Movers | CacheType::Highlights => CLOSED_SUMMARY_TTL_SECS,
                CacheType::Quote => CLOSED_QUOTE_TTL_SECS,
                _ => base * CLOSED_MULTIPLIER,
            },
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_session_returns_base() {
        let policy = ExpiryPolicy::default();
        assert_eq!(policy.ttl(CacheType::Quote, MarketSession::Open), Duration::from_secs(30));
        assert_eq!(policy.ttl(CacheType::Fundamentals, MarketSession::Open), Duration::from_secs(86_400));
    }

    #[test]
    fn closed_sessions_use_fixed_and_tripled_ttls() {
        let policy = ExpiryPolicy::default();
        for session in [MarketSession::Closed, MarketSession::ClosedWeekend] {
            assert_eq!(policy.ttl(CacheType::Indices, session), Duration::from_secs(3600));
            assert_eq!(policy.ttl(CacheType::Movers, session), Duration::from_secs(3600));
            assert_eq!(policy.ttl(CacheType::Highlights, session), Duration::from_secs(3600));
            assert_eq!(policy.ttl(CacheType::Quote, session), Duration::from_secs(1800));
            assert_eq!(policy.ttl(CacheType::BatchQuotes, session), Duration::from_secs(180));
            assert_eq!(policy.ttl(CacheType::SectorData, session), Duration::from_secs(1800));
        }
    }

    #[test]
    fn pre_market_doubles() {
        let policy = ExpiryPolicy::default();
        assert_eq!(policy.ttl(CacheType::Quote, MarketSession::PreMarket), Duration::from_secs(60));
        assert_eq!(policy.ttl(CacheType::Snapshot, MarketSession::PreMarket), Duration::from_secs(1_209_600));
    }

    #[test]
    fn overrides_are_validated() {
        let mut overrides = HashMap::new();
        overrides.insert("quote".to_string(), 15);
        let policy = ExpiryPolicy::with_overrides(&overrides).unwrap();
        assert_eq!(policy.base(CacheType::Quote), Duration::from_secs(15));

        overrides.insert("nonsense".to_string(), 10);
        assert!(matches!(ExpiryPolicy::with_overrides(&overrides), Err(CacheError::Configuration(_))));

        let mut zero = HashMap::new();
        zero.insert("indices".to_string(), 0);
        assert!(ExpiryPolicy::with_overrides(&zero).is_err());

        let mut inverted = HashMap::new();
        inverted.insert("quote".to_string(), 100_000);
        assert!(ExpiryPolicy::with_overrides(&inverted).is_err());
    }
}
