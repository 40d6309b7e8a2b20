//! Two-sided CUSUM change-point detection.
//!
//! Accumulates small deviations of the per-bar return against an
//! ATR-scaled drift allowance; when either cumulative sum exceeds the
//! ATR-scaled threshold a change point fires, both sums reset, and the
//! reversal threshold is reduced with linear decay.

use crate::domain::analysis::CusumSettings;

use super::reduction::{apply_decay, BarColumns, ThresholdReduction};

pub struct Cusum {
    settings: CusumSettings,
}

impl Cusum {
    pub fn new(settings: CusumSettings) -> Self {
        Self { settings }
    }
}

impl ThresholdReduction for Cusum {
    fn name(&self) -> &'static str {
        "cusum"
    }

    fn compute(&self, cols: &BarColumns<'_>, atr: &[f64]) -> Vec<f64> {
        let closes = cols.closes;
        let n = closes.len();
        let mut reduction = vec![1.0; n];
        if n < 2 {
            return reduction;
        }

        let s = &self.settings;
        let mut s_pos = 0.0f64;
        let mut s_neg = 0.0f64;
        let mut change_points = Vec::new();

        for i in 1..n {
            let ret = closes[i] - closes[i - 1];
            let mut bar_atr = if atr[i].is_nan() { 0.0 } else { atr[i] };
            if bar_atr <= 0.0 {
                // ATR warmup: the absolute return is the volatility proxy.
                bar_atr = ret.abs().max(1e-10);
            }

            let drift = s.drift_fraction * bar_atr;
            let threshold = s.threshold_mult * bar_atr;

            s_pos = (s_pos + ret - drift).max(0.0);
            s_neg = (s_neg - ret - drift).max(0.0);

            if s_pos > threshold || s_neg > threshold {
                change_points.push(i);
                s_pos = 0.0;
                s_neg = 0.0;
            }
        }

        for cp in change_points {
            apply_decay(&mut reduction, cp, s.min_reduction, s.decay_bars);
        }

        reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(closes: &[f64]) -> BarColumns<'_> {
        BarColumns {
            opens: closes,
            highs: closes,
            lows: closes,
            closes,
            volumes: closes,
        }
    }

    #[test]
    fn test_flat_series_no_change_points() {
        let closes = vec![100.0; 50];
        let atr = vec![1.0; 50];
        let r = Cusum::new(CusumSettings::default()).compute(&cols(&closes), &atr);
        assert!(r.iter().all(|v| (*v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_structural_shift_fires() {
        // Gentle drift then a sharp sustained move vs a small ATR.
        let mut closes: Vec<f64> = (0..30).map(|_| 100.0).collect();
        for i in 0..20 {
            closes.push(100.0 + (i as f64 + 1.0) * 2.0);
        }
        let atr = vec![1.0; closes.len()];
        let settings = CusumSettings::default();
        let r = Cusum::new(settings.clone()).compute(&cols(&closes), &atr);
        let min = r.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(min < 1.0);
        assert!(min >= settings.min_reduction - 1e-12);
    }

    #[test]
    fn test_short_series_identity() {
        let closes = vec![100.0];
        let r = Cusum::new(CusumSettings::default()).compute(&cols(&closes), &[f64::NAN]);
        assert_eq!(r, vec![1.0]);
    }
}
