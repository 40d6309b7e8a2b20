//! Engine-level invariants: prefix stability, determinism, threshold
//! monotonicity under reductions, pivot alternation.

use chrono::{TimeZone, Utc};

use revtrade::application::engine::DetectionEngine;
use revtrade::domain::analysis::{AnalysisConfig, SensitivityPreset, SignalMode};
use revtrade::domain::market::OhlcvBar;

fn bars_from_prices(prices: &[f64], volumes: &[f64]) -> Vec<OhlcvBar> {
    prices
        .iter()
        .zip(volumes.iter())
        .enumerate()
        .map(|(i, (p, v))| OhlcvBar {
            time: Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap(),
            open: *p,
            high: p + 0.5,
            low: p - 0.5,
            close: *p,
            volume: *v,
        })
        .collect()
}

/// A repeating swing series: clear alternating crests and troughs.
fn wave_bars(n: usize) -> Vec<OhlcvBar> {
    let prices: Vec<f64> = (0..n).map(|i| 100.0 + 15.0 * (i as f64 * 0.3).sin()).collect();
    let volumes = vec![1000.0; n];
    bars_from_prices(&prices, &volumes)
}

fn config_all_reductions(enabled: bool) -> AnalysisConfig {
    let mut cfg = AnalysisConfig {
        sensitivity: SensitivityPreset::High,
        signal_mode: SignalMode::ConfirmedOnly,
        ..AnalysisConfig::default()
    };
    cfg.matrix_profile.enabled = enabled;
    cfg.volume_adaptive.enabled = enabled;
    cfg.candle_pattern.enabled = enabled;
    cfg.cusum.enabled = enabled;
    cfg
}

#[test]
fn prefix_pivots_never_repaint() {
    let bars = wave_bars(120);
    let engine = DetectionEngine::new(config_all_reductions(true));
    let full = engine.execute(&bars);

    for k in [60, 80, 100] {
        let prefix = engine.execute(&bars[..k]);

        // The full run's pivot stream must start with the prefix's:
        // confirmed pivots are emitted once and never revised.
        let full_confirmed: Vec<_> = full.pivots.iter().filter(|p| !p.is_preview).collect();
        let prefix_confirmed: Vec<_> = prefix.pivots.iter().filter(|p| !p.is_preview).collect();
        assert!(
            prefix_confirmed.len() <= full_confirmed.len(),
            "prefix k={k} produced more pivots than the full run"
        );
        for (i, pivot) in prefix_confirmed.iter().enumerate() {
            assert_eq!(*pivot, full_confirmed[i], "pivot {i} changed between prefix k={k} and full run");
        }
    }
}

#[test]
fn prefix_signals_match_outside_discovery_lag() {
    let bars = wave_bars(120);
    let engine = DetectionEngine::new(config_all_reductions(true));
    let full = engine.execute(&bars);

    for k in [60, 80, 100] {
        let prefix = engine.execute(&bars[..k]);
        let cut = k - 10; // margin for pivots discovered after the cut

        let prefix_early: Vec<_> = prefix.signals.iter().filter(|s| s.bar_index < cut).collect();
        let full_early: Vec<_> = full.signals.iter().filter(|s| s.bar_index < cut).collect();
        assert_eq!(prefix_early, full_early, "signals diverged below bar {cut} at k={k}");
    }
}

#[test]
fn deterministic_bit_stable() {
    let bars = wave_bars(150);
    let engine = DetectionEngine::new(config_all_reductions(true));

    let a = engine.execute(&bars);
    let b = engine.execute(&bars);

    assert_eq!(a.signals, b.signals);
    assert_eq!(a.pivots, b.pivots);
    assert_eq!(a.zones, b.zones);
    assert_eq!(a.current_atr.to_bits(), b.current_atr.to_bits());
    assert_eq!(a.current_threshold.to_bits(), b.current_threshold.to_bits());
    for (x, y) in a.trend_history.iter().zip(b.trend_history.iter()) {
        assert_eq!(x.ema_fast.to_bits(), y.ema_fast.to_bits());
        assert_eq!(x.state, y.state);
    }
}

#[test]
fn reductions_only_tighten_thresholds() {
    // Clean V with a volume spike at the trough (the seed scenario).
    let mut prices: Vec<f64> = (0..25).map(|i| 120.0 - 30.0 * i as f64 / 24.0).collect();
    prices.extend((0..35).map(|i| 90.0 + 30.0 * i as f64 / 34.0));
    let mut volumes = vec![1000.0; 60];
    volumes[24] = 5000.0;
    volumes[25] = 5000.0;
    let bars = bars_from_prices(&prices, &volumes);

    let baseline = DetectionEngine::new(config_all_reductions(false)).execute(&bars);
    let reduced = DetectionEngine::new(config_all_reductions(true)).execute(&bars);

    assert!(reduced.current_threshold <= baseline.current_threshold + 1e-12);

    let earliest = |signals: &[revtrade::domain::analysis::ReversalSignal]| {
        signals.iter().filter(|s| s.is_bullish).map(|s| s.bar_index).min()
    };
    let base_idx = earliest(&baseline.signals).expect("baseline bullish signal");
    let reduced_idx = earliest(&reduced.signals).expect("reduced bullish signal");
    assert!(
        reduced_idx <= base_idx,
        "reductions delayed the signal: {reduced_idx} > {base_idx}"
    );
    assert!((22..=28).contains(&base_idx), "baseline signal at bar {base_idx}");
}

#[test]
fn confirmed_pivots_strictly_alternate() {
    let bars = wave_bars(200);
    for confirmation_bars in [0usize, 2, 5] {
        let mut cfg = config_all_reductions(true);
        cfg.confirmation_bars = confirmation_bars;
        let result = DetectionEngine::new(cfg).execute(&bars);

        let confirmed: Vec<_> = result.pivots.iter().filter(|p| !p.is_preview).collect();
        assert!(confirmed.len() >= 4, "wave series should produce several pivots");
        for pair in confirmed.windows(2) {
            assert_ne!(
                pair[0].is_high, pair[1].is_high,
                "pivots must alternate (cb={confirmation_bars})"
            );
        }
    }
}

#[test]
fn confirmation_bars_shift_never_advances_signals() {
    let bars = wave_bars(150);
    let mut base = config_all_reductions(false);
    base.confirmation_bars = 0;
    let mut delayed = config_all_reductions(false);
    delayed.confirmation_bars = 3;

    let r0 = DetectionEngine::new(base).execute(&bars);
    let r3 = DetectionEngine::new(delayed).execute(&bars);

    // Confirmation delay can only produce the same or fewer pivots.
    assert!(r3.pivots.len() <= r0.pivots.len());
    assert!(r3.signals.len() <= r0.signals.len());
}
