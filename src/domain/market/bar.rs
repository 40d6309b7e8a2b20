use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV candle as stored and fed to the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Seconds between consecutive bars, falling back to 60 when fewer than
/// two bars are available or the series is degenerate.
pub fn candle_interval_secs(bars: &[OhlcvBar]) -> i64 {
    if bars.len() >= 2 {
        let delta = (bars[bars.len() - 1].time - bars[bars.len() - 2].time).num_seconds();
        if delta > 0 {
            return delta;
        }
    }
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar_at(secs: i64) -> OhlcvBar {
        OhlcvBar {
            time: Utc.timestamp_opt(secs, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        }
    }

    #[test]
    fn test_candle_interval() {
        assert_eq!(candle_interval_secs(&[bar_at(0), bar_at(300)]), 300);
        assert_eq!(candle_interval_secs(&[bar_at(0)]), 60);
        assert_eq!(candle_interval_secs(&[bar_at(300), bar_at(300)]), 60);
    }
}
