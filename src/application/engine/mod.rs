//! The reversal detection engine.
//!
//! A pure, deterministic pipeline from a chronological OHLCV window to
//! pivots, reversal signals, supply/demand zones and an EMA trend.
//! Nothing in here suspends or touches a clock: the same bars and the
//! same configuration always produce the identical result, and the
//! value computed at bar `i` never depends on bars after `i`.

pub mod atr;
pub mod candle_pattern;
pub mod cusum;
pub mod ema;
pub mod matrix_profile;
pub mod reduction;
pub mod reversal;
pub mod volume_adaptive;
pub mod zigzag;
pub mod zones;

use crate::domain::analysis::{
    AnalysisConfig, AnalysisResult, CalculationMethod, Pivot, ReversalSignal, SignalMode,
};
use crate::domain::market::OhlcvBar;

use self::candle_pattern::CandlePattern;
use self::cusum::Cusum;
use self::matrix_profile::MatrixProfile;
use self::reduction::{BarColumns, ThresholdReduction};
use self::volume_adaptive::VolumeAdaptive;
use self::zigzag::ZigZag;

pub struct DetectionEngine {
    config: AnalysisConfig,
}

impl DetectionEngine {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Run the full pipeline over `bars`.
    ///
    /// Total over any window length; the analysis service applies the
    /// minimum-bar floor before calling in. Prefix stability depends on
    /// the engine being defined for every prefix.
    pub fn execute(&self, bars: &[OhlcvBar]) -> AnalysisResult {
        let n = bars.len();
        if n == 0 {
            return AnalysisResult::default();
        }

        let cfg = &self.config;
        let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        // ── 1. ATR ──────────────────────────────────────────────
        let atr_values = atr::atr(&highs, &lows, &closes, cfg.atr_length);

        // ── 2. Base reversal thresholds ─────────────────────────
        let sens = cfg.resolved_sensitivity();
        let mut reversal_amounts: Vec<f64> = (0..n)
            .map(|i| {
                let pct_amount = closes[i] * sens.percent_threshold / 100.0;
                let atr_safe = if atr_values[i].is_nan() { 0.0 } else { atr_values[i] };
                let atr_amount = sens.atr_multiplier * atr_safe;
                pct_amount.max(cfg.absolute_reversal.max(atr_amount))
            })
            .collect();

        // ── 3. Threshold reductions (product fold) ──────────────
        let cols = BarColumns {
            opens: &opens,
            highs: &highs,
            lows: &lows,
            closes: &closes,
            volumes: &volumes,
        };
        let modules = self.reduction_modules();
        reduction::apply(&mut reversal_amounts, &modules, &cols, &atr_values);

        // ── 4. ZigZag pivots ────────────────────────────────────
        let zz = ZigZag::new(
            cfg.method == CalculationMethod::Average,
            cfg.average_length,
            cfg.confirmation_bars,
        );

        let confirmed_pivots: Vec<Pivot> = if cfg.signal_mode != SignalMode::PreviewOnly {
            zz.compute_pivots(&highs, &lows, &reversal_amounts)
        } else {
            Vec::new()
        };

        let preview_pivots: Vec<Pivot> = if cfg.signal_mode != SignalMode::ConfirmedOnly {
            zz.compute_preview_pivots(&highs, &lows, &reversal_amounts)
        } else {
            Vec::new()
        };

        // ── 5. Reversal signals ─────────────────────────────────
        let (price_h, price_l) = zz.prepare_prices(&highs, &lows);
        let (ph_conf, pl_conf) = shift_confirmed(&price_h, &price_l, cfg.confirmation_bars);

        let confirmed_signals = reversal::detect(&confirmed_pivots, n, &ph_conf, &pl_conf);

        // Preview pivots map straight to signals: the pivot *is* the
        // signal, without the U1/D1 price confirmation.
        let preview_signals: Vec<ReversalSignal> = preview_pivots
            .iter()
            .map(|p| ReversalSignal {
                bar_index: p.bar_index,
                price: p.price,
                actual_price: p.actual_price,
                is_bullish: !p.is_high,
                is_preview: true,
            })
            .collect();

        // ── 6. Supply/demand zones ──────────────────────────────
        let zones = if cfg.zones.generate {
            zones::generate_zones(&confirmed_pivots, &cfg.zones)
        } else {
            Vec::new()
        };

        // ── 7. EMA trend ────────────────────────────────────────
        let trend_history = ema::compute_trend(&closes, &highs, &lows, cfg.ema_fast, cfg.ema_mid, cfg.ema_slow);

        let current_atr = match atr_values.last() {
            Some(v) if v.is_finite() => *v,
            _ => 0.0,
        };
        let current_threshold = reversal_amounts.last().copied().unwrap_or(0.0);

        let mut signals = confirmed_signals;
        signals.extend(preview_signals);

        let mut pivots = confirmed_pivots;
        pivots.extend(preview_pivots);

        AnalysisResult {
            current_trend: trend_history.last().copied(),
            signals,
            pivots,
            zones,
            trend_history,
            current_atr,
            current_threshold,
            atr_multiplier: sens.atr_multiplier,
        }
    }

    fn reduction_modules(&self) -> Vec<Box<dyn ThresholdReduction>> {
        let cfg = &self.config;
        let mut modules: Vec<Box<dyn ThresholdReduction>> = Vec::new();

        if cfg.matrix_profile.enabled {
            modules.push(Box::new(MatrixProfile::from_settings(&cfg.matrix_profile, cfg.timeframe)));
        }
        if cfg.volume_adaptive.enabled {
            modules.push(Box::new(VolumeAdaptive::new(cfg.volume_adaptive.clone())));
        }
        if cfg.candle_pattern.enabled {
            modules.push(Box::new(CandlePattern::new(cfg.candle_pattern.clone())));
        }
        if cfg.cusum.enabled {
            modules.push(Box::new(Cusum::new(cfg.cusum.clone())));
        }

        modules
    }
}

/// Shift the smoothed price series by the confirmation delay; the
/// leading `cb` entries become NaN so nothing confirms early.
fn shift_confirmed(price_h: &[f64], price_l: &[f64], cb: usize) -> (Vec<f64>, Vec<f64>) {
    if cb == 0 {
        return (price_h.to_vec(), price_l.to_vec());
    }
    let n = price_h.len();
    let mut ph = vec![f64::NAN; n];
    let mut pl = vec![f64::NAN; n];
    for i in cb..n {
        ph[i] = price_h[i - cb];
        pl[i] = price_l[i - cb];
    }
    (ph, pl)
}
