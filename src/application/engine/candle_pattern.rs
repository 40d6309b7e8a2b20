//! Candlestick-pattern threshold reduction.
//!
//! Engulfing is the strongest evidence, hammer / shooting star next,
//! doji weakest; the first matching pattern wins on each bar.

use crate::domain::analysis::CandlePatternSettings;

use super::reduction::{BarColumns, ThresholdReduction};

pub struct CandlePattern {
    settings: CandlePatternSettings,
}

impl CandlePattern {
    pub fn new(settings: CandlePatternSettings) -> Self {
        Self { settings }
    }
}

impl ThresholdReduction for CandlePattern {
    fn name(&self) -> &'static str {
        "candle_pattern"
    }

    fn compute(&self, cols: &BarColumns<'_>, _atr: &[f64]) -> Vec<f64> {
        let (opens, highs, lows, closes) = (cols.opens, cols.highs, cols.lows, cols.closes);
        let n = closes.len();
        let mut reduction: Vec<f64> = vec![1.0; n];
        let s = &self.settings;

        for i in 1..n {
            let body = (closes[i] - opens[i]).abs();
            let full_range = highs[i] - lows[i];
            if full_range < 1e-10 {
                continue;
            }

            let ratio = body / full_range;
            let prev_body_signed = closes[i - 1] - opens[i - 1];

            // Bullish engulfing: bearish candle swallowed by a bullish body.
            if prev_body_signed < 0.0
                && closes[i] > opens[i]
                && closes[i] > opens[i - 1]
                && opens[i] < closes[i - 1]
            {
                reduction[i] = reduction[i].min(s.engulfing_reduction);
                continue;
            }

            // Bearish engulfing.
            if prev_body_signed > 0.0
                && closes[i] < opens[i]
                && closes[i] < opens[i - 1]
                && opens[i] > closes[i - 1]
            {
                reduction[i] = reduction[i].min(s.engulfing_reduction);
                continue;
            }

            let lower_shadow = opens[i].min(closes[i]) - lows[i];
            let upper_shadow = highs[i] - opens[i].max(closes[i]);

            // Hammer: small body at the top, long lower shadow.
            if ratio < s.body_ratio_threshold
                && lower_shadow > 2.0 * body
                && upper_shadow < body
                && closes[i] >= opens[i]
            {
                reduction[i] = reduction[i].min(s.hammer_reduction);
                continue;
            }

            // Shooting star: small body at the bottom, long upper shadow.
            if ratio < s.body_ratio_threshold
                && upper_shadow > 2.0 * body
                && lower_shadow < body
                && closes[i] <= opens[i]
            {
                reduction[i] = reduction[i].min(s.hammer_reduction);
                continue;
            }

            // Doji: indecision.
            if ratio < 0.10 {
                reduction[i] = reduction[i].min(s.doji_reduction);
            }
        }

        reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Candles {
        opens: Vec<f64>,
        highs: Vec<f64>,
        lows: Vec<f64>,
        closes: Vec<f64>,
        volumes: Vec<f64>,
    }

    impl Candles {
        fn new(ohlc: &[(f64, f64, f64, f64)]) -> Self {
            Self {
                opens: ohlc.iter().map(|c| c.0).collect(),
                highs: ohlc.iter().map(|c| c.1).collect(),
                lows: ohlc.iter().map(|c| c.2).collect(),
                closes: ohlc.iter().map(|c| c.3).collect(),
                volumes: vec![0.0; ohlc.len()],
            }
        }

        fn cols(&self) -> BarColumns<'_> {
            BarColumns {
                opens: &self.opens,
                highs: &self.highs,
                lows: &self.lows,
                closes: &self.closes,
                volumes: &self.volumes,
            }
        }
    }

    fn run(candles: &Candles) -> Vec<f64> {
        CandlePattern::new(CandlePatternSettings::default()).compute(&candles.cols(), &[])
    }

    #[test]
    fn test_bullish_engulfing() {
        // Bearish candle, then a bullish body engulfing it.
        let c = Candles::new(&[(100.0, 101.0, 97.0, 98.0), (97.5, 102.5, 97.0, 101.0)]);
        let r = run(&c);
        assert!((r[1] - 0.50).abs() < 1e-12);
    }

    #[test]
    fn test_hammer() {
        // Long lower shadow, small body closing near the high.
        let c = Candles::new(&[(100.0, 101.0, 99.0, 100.5), (100.0, 101.0, 95.0, 100.8)]);
        let r = run(&c);
        assert!((r[1] - 0.65).abs() < 1e-12);
    }

    #[test]
    fn test_shooting_star() {
        let c = Candles::new(&[(100.0, 101.0, 99.0, 100.5), (100.8, 106.0, 100.0, 100.1)]);
        let r = run(&c);
        assert!((r[1] - 0.65).abs() < 1e-12);
    }

    #[test]
    fn test_doji() {
        let c = Candles::new(&[(100.0, 101.0, 99.0, 100.5), (100.0, 102.0, 98.0, 100.05)]);
        let r = run(&c);
        assert!((r[1] - 0.80).abs() < 1e-12);
    }

    #[test]
    fn test_plain_candle_is_identity() {
        let c = Candles::new(&[(100.0, 101.0, 99.0, 100.5), (100.5, 103.0, 100.2, 102.8)]);
        let r = run(&c);
        assert!((r[1] - 1.0).abs() < 1e-12);
    }
}
