//! Matrix-profile regime-change detection.
//!
//! Novelty spikes in the matrix-profile distance over close-price
//! log-returns correlate strongly with trend reversals. Near a detected
//! regime change the reversal threshold is lowered so the zigzag
//! confirms pivots a few candles earlier.
//!
//! The profile here is the *left* matrix profile: each subsequence is
//! compared only against subsequences that end no later than it does,
//! keeping the module causal.

use statrs::statistics::Statistics;

use crate::domain::analysis::MatrixProfileSettings;
use crate::domain::market::Timeframe;

use super::reduction::{apply_decay, BarColumns, ThresholdReduction};

#[derive(Debug, Clone, Copy)]
struct ChangePoint {
    bar_index: usize,
    score: f64,
}

pub struct MatrixProfile {
    subsequence_length: usize,
    z_threshold: f64,
    rolling_window: usize,
    min_reduction: f64,
    decay_bars: usize,
}

impl MatrixProfile {
    pub fn from_settings(settings: &MatrixProfileSettings, timeframe: Timeframe) -> Self {
        Self {
            subsequence_length: settings
                .subsequence_length
                .unwrap_or_else(|| Self::default_subsequence_length(timeframe)),
            z_threshold: settings.z_threshold,
            rolling_window: settings.rolling_window,
            min_reduction: settings.min_reduction,
            decay_bars: settings.decay_bars,
        }
    }

    /// Shorter windows on slow timeframes: fewer bars carry the same
    /// information.
    fn default_subsequence_length(timeframe: Timeframe) -> usize {
        match timeframe {
            Timeframe::OneMin => 20,
            Timeframe::FiveMin => 14,
            Timeframe::FifteenMin => 12,
            Timeframe::ThirtyMin | Timeframe::OneHour => 10,
            Timeframe::FourHour => 8,
            Timeframe::OneDay => 6,
            Timeframe::OneWeek => 5,
            Timeframe::OneMonth => 4,
        }
    }

    pub fn subsequence_length(&self) -> usize {
        self.subsequence_length
    }

    /// Log-returns; non-finite entries (zero/negative prices) become 0.
    fn log_returns(closes: &[f64]) -> Vec<f64> {
        closes
            .windows(2)
            .map(|w| {
                let lr = (w[1] / w[0]).ln();
                if lr.is_finite() {
                    lr
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Z-normalize each sliding window; near-constant windows map to
    /// zeros so their distance is well defined.
    fn normalized_windows(ts: &[f64], m: usize) -> Vec<Vec<f64>> {
        let count = ts.len() + 1 - m;
        let mut windows = Vec::with_capacity(count);
        for start in 0..count {
            let chunk = &ts[start..start + m];
            let mu = chunk.iter().mean();
            let sd = chunk.iter().population_std_dev();
            let normalized = if sd > 1e-10 {
                chunk.iter().map(|v| (v - mu) / sd).collect()
            } else {
                vec![0.0; m]
            };
            windows.push(normalized);
        }
        windows
    }

    /// Left matrix profile: distance of each window to its nearest
    /// neighbor among strictly earlier windows, with an exclusion zone
    /// suppressing trivial matches. Windows without an eligible
    /// neighbor get NaN.
    fn left_profile(windows: &[Vec<f64>], m: usize) -> Vec<f64> {
        let exclusion = (m / 4).max(1);
        let count = windows.len();
        let mut profile = vec![f64::NAN; count];

        for i in 0..count {
            if i < exclusion {
                continue;
            }
            let mut best = f64::INFINITY;
            for j in 0..=(i - exclusion) {
                let dist_sq: f64 = windows[i]
                    .iter()
                    .zip(windows[j].iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if dist_sq < best {
                    best = dist_sq;
                }
            }
            if best.is_finite() {
                profile[i] = best.sqrt();
            }
        }

        profile
    }

    /// Causal rolling z-score; NaN inputs stay NaN, degenerate windows
    /// score 0.
    fn rolling_z_score(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        let window = self.rolling_window.max(1);
        let mut out = vec![f64::NAN; n];

        for i in 0..n {
            if values[i].is_nan() {
                continue;
            }
            let start = i.saturating_sub(window - 1);
            let chunk: Vec<f64> = values[start..=i].iter().copied().filter(|v| v.is_finite()).collect();
            if chunk.is_empty() {
                continue;
            }
            let mu = chunk.iter().mean();
            let sd = chunk.iter().population_std_dev();
            out[i] = if sd > 1e-10 { (values[i] - mu) / sd } else { 0.0 };
        }

        out
    }

    /// Keep only the strongest change point in every `min_gap` window:
    /// a weaker echo within the gap is suppressed, a stronger one still
    /// registers. A point already kept is never retracted — retraction
    /// would alter reductions on bars that were already emitted.
    fn merge_nearby(points: Vec<ChangePoint>, min_gap: usize) -> Vec<ChangePoint> {
        let mut merged: Vec<ChangePoint> = Vec::new();
        for pt in points {
            match merged.last() {
                Some(last) if pt.bar_index - last.bar_index < min_gap && pt.score <= last.score => {}
                _ => merged.push(pt),
            }
        }
        merged
    }
}

impl ThresholdReduction for MatrixProfile {
    fn name(&self) -> &'static str {
        "matrix_profile"
    }

    fn compute(&self, cols: &BarColumns<'_>, _atr: &[f64]) -> Vec<f64> {
        let closes = cols.closes;
        let n = closes.len();
        let m = self.subsequence_length;
        let mut reduction = vec![1.0; n];

        if m == 0 || n < 2 * m + self.rolling_window {
            return reduction;
        }

        let ts = Self::log_returns(closes);
        if ts.len() < 2 * m {
            return reduction;
        }

        let windows = Self::normalized_windows(&ts, m);
        let profile = Self::left_profile(&windows, m);
        let z_scores = self.rolling_z_score(&profile);

        // Window j ends at ts index j + m − 1; returns are one shorter
        // than closes, so the novelty lands on bar j + m.
        let offset = m;
        let mut novelty = vec![f64::NAN; n];
        for (j, z) in z_scores.iter().enumerate() {
            let bar = j + offset;
            if bar < n {
                novelty[bar] = *z;
            }
        }

        let mut change_points = Vec::new();
        for (bar, score) in novelty.iter().enumerate() {
            if score.is_finite() && *score >= self.z_threshold {
                change_points.push(ChangePoint {
                    bar_index: bar,
                    score: *score,
                });
            }
        }
        let change_points = Self::merge_nearby(change_points, m);

        for cp in change_points {
            // strength ∈ [0, 1): stronger anomalies push the floor
            // closer to min_reduction.
            let excess = (cp.score - self.z_threshold).max(0.0);
            let strength = 1.0 - 1.0 / (1.0 + excess);
            let floor = self.min_reduction + (1.0 - strength) * (1.0 - self.min_reduction);
            apply_decay(&mut reduction, cp.bar_index, floor, self.decay_bars);
        }

        reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::MatrixProfileSettings;

    fn cols(closes: &[f64]) -> BarColumns<'_> {
        BarColumns {
            opens: closes,
            highs: closes,
            lows: closes,
            closes,
            volumes: closes,
        }
    }

    fn module() -> MatrixProfile {
        MatrixProfile::from_settings(&MatrixProfileSettings::default(), Timeframe::OneHour)
    }

    #[test]
    fn test_subsequence_defaults_scale_with_timeframe() {
        let fast = MatrixProfile::from_settings(&MatrixProfileSettings::default(), Timeframe::OneMin);
        let slow = MatrixProfile::from_settings(&MatrixProfileSettings::default(), Timeframe::OneDay);
        assert!(fast.subsequence_length() > slow.subsequence_length());
    }

    #[test]
    fn test_too_few_bars_is_identity() {
        let closes = vec![100.0; 20];
        let r = module().compute(&cols(&closes), &[]);
        assert_eq!(r, vec![1.0; 20]);
    }

    #[test]
    fn test_regime_change_reduces_threshold() {
        // Repetitive small oscillation, then an abrupt structural break.
        let mut closes = Vec::new();
        for i in 0..80 {
            closes.push(100.0 + if i % 2 == 0 { 0.2 } else { -0.2 });
        }
        for i in 0..20 {
            closes.push(100.0 + 3.0 * (i as f64 + 1.0));
        }
        let r = module().compute(&cols(&closes), &[]);
        let min = r.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(min < 1.0);
        assert!(min >= 0.40 - 1e-12);
        // The oscillating warmup region stays untouched.
        assert!(r[..60].iter().all(|v| (*v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_merge_suppresses_weaker_echoes() {
        let merged = MatrixProfile::merge_nearby(
            vec![
                ChangePoint { bar_index: 10, score: 3.0 },
                ChangePoint { bar_index: 12, score: 2.0 },
                ChangePoint { bar_index: 40, score: 2.5 },
            ],
            10,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].bar_index, 10);
        assert_eq!(merged[1].bar_index, 40);
    }

    #[test]
    fn test_merge_registers_stronger_follow_up() {
        let merged = MatrixProfile::merge_nearby(
            vec![
                ChangePoint { bar_index: 10, score: 2.0 },
                ChangePoint { bar_index: 12, score: 3.0 },
            ],
            10,
        );
        // The earlier point stays (its reductions were already
        // emitted); the stronger follow-up registers as well.
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_causal_prefix_stability() {
        // Reductions on early bars must not change when later bars are
        // appended.
        let mut closes = Vec::new();
        for i in 0..90 {
            closes.push(100.0 + (i as f64 * 0.7).sin());
        }
        let full: Vec<f64> = {
            let mut c = closes.clone();
            for i in 0..30 {
                c.push(120.0 + 5.0 * i as f64);
            }
            c
        };

        let r_prefix = module().compute(&cols(&closes), &[]);
        let r_full = module().compute(&cols(&full), &[]);

        // Bars that the full run's new data could legitimately touch
        // start at the prefix end minus the decay window.
        for i in 0..closes.len() {
            assert!(
                (r_prefix[i] - r_full[i]).abs() < 1e-12,
                "reduction changed at bar {}",
                i
            );
        }
    }
}
