use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle interval supported by the exchange fetchers and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    ThirtyMin,
    OneHour,
    FourHour,
    OneDay,
    OneWeek,
    OneMonth,
}

impl Timeframe {
    /// Duration of one candle in minutes (a month counts as 30 days).
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::FiveMin => 5,
            Timeframe::FifteenMin => 15,
            Timeframe::ThirtyMin => 30,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440,
            Timeframe::OneWeek => 10080,
            Timeframe::OneMonth => 43200,
        }
    }

    /// Duration of one candle in seconds.
    pub fn seconds(&self) -> i64 {
        self.minutes() * 60
    }

    /// Canonical exchange string ("1m", "4h", "1M", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1m",
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::ThirtyMin => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1M",
        }
    }

    /// Higher timeframe consulted for trend confirmation.
    ///
    /// One level up only; daily and above have no higher check.
    pub fn higher(&self) -> Option<Timeframe> {
        match self {
            Timeframe::OneMin => Some(Timeframe::FiveMin),
            Timeframe::FiveMin => Some(Timeframe::FifteenMin),
            Timeframe::FifteenMin => Some(Timeframe::OneHour),
            Timeframe::ThirtyMin => Some(Timeframe::OneHour),
            Timeframe::OneHour => Some(Timeframe::FourHour),
            Timeframe::FourHour => Some(Timeframe::OneDay),
            Timeframe::OneDay | Timeframe::OneWeek | Timeframe::OneMonth => None,
        }
    }

    /// Minimum seconds between two scheduler cycles of the same agent.
    pub fn cycle_throttle_secs(&self) -> u64 {
        match self {
            Timeframe::OneMin | Timeframe::FiveMin => 55,
            Timeframe::FifteenMin | Timeframe::OneHour => 240,
            Timeframe::FourHour => 840,
            Timeframe::OneDay => 3540,
            _ => 240,
        }
    }

    /// TTL of the per-pair fetch throttle: one candle minus a grace
    /// window, never below 30 s.
    pub fn fetch_throttle_secs(&self) -> u64 {
        (self.seconds() - 15).max(30) as u64
    }

    /// How many candles a signal stays actionable after detection.
    pub fn staleness_budget_candles(&self) -> i64 {
        let m = self.minutes();
        if m <= 1 {
            15
        } else if m <= 5 {
            10
        } else if m <= 15 {
            8
        } else if m <= 60 {
            6
        } else {
            4
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // "1M" is months; every other unit is case-insensitive.
        if s == "1M" {
            return Ok(Timeframe::OneMonth);
        }
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Timeframe::OneMin),
            "5m" => Ok(Timeframe::FiveMin),
            "15m" => Ok(Timeframe::FifteenMin),
            "30m" => Ok(Timeframe::ThirtyMin),
            "1h" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHour),
            "1d" => Ok(Timeframe::OneDay),
            "1w" => Ok(Timeframe::OneWeek),
            _ => Err(anyhow!(
                "Invalid timeframe: '{}'. Valid options: 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w, 1M",
                s
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
