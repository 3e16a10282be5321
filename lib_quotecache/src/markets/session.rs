//! # Market Session Clock
//!
//! Derives the current trading phase from wall-clock time in the exchange's
//! timezone. The session is never stored; every caller recomputes it, so a TTL
//! decision always reflects the phase at the moment of the write.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::error::CacheError;

/// Phase of the trading day, used to scale cache freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarketSession {
    Open,
    PreMarket,
    Closed,
    ClosedWeekend,
}

impl MarketSession {
    /// True for both closed variants.
    pub fn is_closed(self) -> bool {
        matches!(self, MarketSession::Closed | MarketSession::ClosedWeekend)
    }
}

/// Source of time and market phase for every component.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Market phase at `now()`.
    fn market_session(&self) -> MarketSession;
}

/// Trading hours of one exchange.
#[derive(Debug, Clone)]
pub struct MarketHours {
    pub timezone: Tz,
    pub pre_open: NaiveTime,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub holidays: HashSet<NaiveDate>,
}

impl Default for MarketHours {
    /// NSE cash segment: pre-open 09:00, continuous trading 09:15 - 15:30 IST.
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            pre_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            holidays: HashSet::new(),
        }
    }
}

impl MarketHours {
    /// Builds hours from config strings (`HH:MM` times, IANA timezone, `YYYY-MM-DD` holidays).
    pub fn parse(
        timezone: &str,
        pre_open: &str,
        open: &str,
        close: &str,
        holidays: &[String],
    ) -> Result<Self, CacheError> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| CacheError::Configuration(format!("invalid timezone '{}': {}", timezone, e)))?;
        let pre_open = parse_hhmm(pre_open)?;
        let open = parse_hhmm(open)?;
        let close = parse_hhmm(close)?;
        if !(pre_open <= open && open < close) {
            return Err(CacheError::Configuration(format!(
                "market hours must satisfy preOpen <= open < close (got {} / {} / {})",
                pre_open, open, close
            )));
        }
        let holidays = holidays
            .iter()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|e| CacheError::Configuration(format!("invalid holiday '{}': {}", d, e)))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self { timezone, pre_open, open, close, holidays })
    }

    /// Classifies an instant against these hours.
    pub fn session_at(&self, at: DateTime<Utc>) -> MarketSession {
        let local = at.with_timezone(&self.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::ClosedWeekend;
        }
        if self.holidays.contains(&local.date_naive()) {
            return MarketSession::Closed;
        }
        let t = local.time();
        if t >= self.open && t < self.close {
            MarketSession::Open
        } else if t >= self.pre_open && t < self.open {
            MarketSession::PreMarket
        } else {
            MarketSession::Closed
        }
    }

    /// Local calendar date of an instant in the exchange timezone.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }
}

/// Parses `HH:MM` (or `HH:MM:SS`).
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, CacheError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .map_err(|e| CacheError::Configuration(format!("invalid time '{}': {}", s, e)))
}

/// Wall-clock implementation of `Clock`.
#[derive(Debug, Clone, Default)]
pub struct MarketClock {
    hours: MarketHours,
}

impl MarketClock {
    pub fn new(hours: MarketHours) -> Self {
        Self { hours }
    }

    pub fn hours(&self) -> &MarketHours {
        &self.hours
    }
}

impl Clock for MarketClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn market_session(&self) -> MarketSession {
        self.hours.session_at(Utc::now())
    }
}

/// A hand-driven clock for tests and replays. The session is set explicitly
/// rather than derived, so TTL behaviour can be pinned independently of time.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, MarketSession)>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>, session: MarketSession) -> Self {
        Self { state: Mutex::new((start, session)) }
    }

    /// Moves time forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 += Duration::from_std(by).unwrap_or_else(|_| Duration::zero());
    }

    pub fn set_time(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0 = at;
    }

    pub fn set_session(&self, session: MarketSession) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1 = session;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn market_session(&self) -> MarketSession {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}
