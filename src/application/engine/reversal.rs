//! U1/D1 reversal signal detection from zigzag pivots.

use crate::domain::analysis::{Pivot, ReversalSignal};

#[derive(Debug, Default)]
struct SignalState {
    /// Extreme inflection low / high and their raw counterparts.
    eil: Option<f64>,
    eih: Option<f64>,
    eil_actual: Option<f64>,
    eih_actual: Option<f64>,
    eil_bar: usize,
    eih_bar: usize,
    dir: i32,
    signal: i32,
    prev_signal: i32,
}

/// Walk the bars in order; each pivot updates the extreme inflection
/// levels and flips direction. A bullish signal fires when, with
/// direction up, the confirmed low crosses above the inflection low
/// (symmetric for bearish). Emission happens only on sign transitions.
pub fn detect(pivots: &[Pivot], n_bars: usize, price_h: &[f64], price_l: &[f64]) -> Vec<ReversalSignal> {
    let mut state = SignalState::default();
    let mut signals = Vec::new();

    let mut sorted: Vec<&Pivot> = pivots.iter().collect();
    sorted.sort_by_key(|p| p.bar_index);
    let mut next = 0usize;

    for i in 0..n_bars {
        let ph = if price_h[i].is_nan() { None } else { Some(price_h[i]) };
        let pl = if price_l[i].is_nan() { None } else { Some(price_l[i]) };

        while next < sorted.len() && sorted[next].bar_index <= i {
            let p = sorted[next];
            if p.is_high {
                state.eih = Some(p.price);
                state.eih_actual = Some(p.actual_price);
                state.eih_bar = p.bar_index;
                state.dir = -1;
            } else {
                state.eil = Some(p.price);
                state.eil_actual = Some(p.actual_price);
                state.eil_bar = p.bar_index;
                state.dir = 1;
            }
            next += 1;
        }

        state.prev_signal = state.signal;

        if state.dir > 0 {
            if let (Some(pl), Some(eil)) = (pl, state.eil) {
                if pl > eil && state.signal <= 0 {
                    state.signal = 1;
                }
            }
        } else if state.dir < 0 {
            if let (Some(ph), Some(eih)) = (ph, state.eih) {
                if ph < eih && state.signal >= 0 {
                    state.signal = -1;
                }
            }
        }

        if state.signal > 0 && state.prev_signal <= 0 {
            if let Some(eil) = state.eil {
                signals.push(ReversalSignal {
                    bar_index: state.eil_bar,
                    price: eil,
                    actual_price: state.eil_actual.unwrap_or(eil),
                    is_bullish: true,
                    is_preview: false,
                });
            }
        }

        if state.signal < 0 && state.prev_signal >= 0 {
            if let Some(eih) = state.eih {
                signals.push(ReversalSignal {
                    bar_index: state.eih_bar,
                    price: eih,
                    actual_price: state.eih_actual.unwrap_or(eih),
                    is_bullish: false,
                    is_preview: false,
                });
            }
        }
    }

    signals
}
