//! Non-repainting zigzag over per-bar reversal thresholds.

use crate::domain::analysis::Pivot;

use super::ema::ema;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    None,
    Up,
    Down,
}

#[derive(Debug)]
struct ZigZagState {
    direction: Direction,
    zhigh: f64,
    zlow: f64,
    zhigh_actual: f64,
    zlow_actual: f64,
    zhigh_bar: usize,
    zlow_bar: usize,
}

impl ZigZagState {
    fn new() -> Self {
        Self {
            direction: Direction::None,
            zhigh: f64::NAN,
            zlow: f64::NAN,
            zhigh_actual: f64::NAN,
            zlow_actual: f64::NAN,
            zhigh_bar: 0,
            zlow_bar: 0,
        }
    }
}

/// ZigZag with optional EMA smoothing and confirmation delay.
#[derive(Debug, Clone)]
pub struct ZigZag {
    pub use_ema: bool,
    pub ema_length: usize,
    pub confirmation_bars: usize,
}

impl ZigZag {
    pub fn new(use_ema: bool, ema_length: usize, confirmation_bars: usize) -> Self {
        Self {
            use_ema,
            ema_length,
            confirmation_bars,
        }
    }

    /// Smoothed or raw price series depending on the method.
    pub fn prepare_prices(&self, highs: &[f64], lows: &[f64]) -> (Vec<f64>, Vec<f64>) {
        if self.use_ema {
            (ema(highs, self.ema_length), ema(lows, self.ema_length))
        } else {
            (highs.to_vec(), lows.to_vec())
        }
    }

    /// Confirmed pivots. At bar `i` the *confirmed* bar
    /// `ci = i − confirmation_bars` is evaluated against the threshold
    /// `rev[ci]` — indexing the threshold at the confirmed bar, not the
    /// current one, is what keeps the output free of look-ahead.
    pub fn compute_pivots(&self, highs: &[f64], lows: &[f64], reversal_amounts: &[f64]) -> Vec<Pivot> {
        let n = highs.len();
        let (price_h, price_l) = self.prepare_prices(highs, lows);
        let cb = self.confirmation_bars;

        let mut state = ZigZagState::new();
        let mut pivots = Vec::new();

        for i in 0..n {
            if i < cb {
                continue;
            }
            let ci = i - cb;

            let ph = price_h[ci];
            let pl = price_l[ci];
            let ah = highs[ci];
            let al = lows[ci];

            if ph.is_nan() || pl.is_nan() {
                continue;
            }

            let rev = reversal_amounts[ci];
            if rev.is_nan() {
                continue;
            }

            match state.direction {
                Direction::None => {
                    state.zhigh = ph;
                    state.zlow = pl;
                    state.zhigh_actual = ah;
                    state.zlow_actual = al;
                    state.zhigh_bar = ci;
                    state.zlow_bar = ci;
                    state.direction = Direction::Up;
                }
                Direction::Up => {
                    if ph > state.zhigh {
                        state.zhigh = ph;
                        state.zhigh_actual = ah;
                        state.zhigh_bar = ci;
                    }

                    if state.zhigh - pl >= rev {
                        pivots.push(Pivot {
                            price: state.zhigh,
                            actual_price: state.zhigh_actual,
                            bar_index: state.zhigh_bar,
                            is_high: true,
                            is_preview: false,
                        });
                        state.direction = Direction::Down;
                        state.zlow = pl;
                        state.zlow_actual = al;
                        state.zlow_bar = ci;
                    }
                }
                Direction::Down => {
                    if pl < state.zlow {
                        state.zlow = pl;
                        state.zlow_actual = al;
                        state.zlow_bar = ci;
                    }

                    if ph - state.zlow >= rev {
                        pivots.push(Pivot {
                            price: state.zlow,
                            actual_price: state.zlow_actual,
                            bar_index: state.zlow_bar,
                            is_high: false,
                            is_preview: false,
                        });
                        state.direction = Direction::Up;
                        state.zhigh = ph;
                        state.zhigh_actual = ah;
                        state.zhigh_bar = ci;
                    }
                }
            }
        }

        pivots
    }

    /// Preview pass: same walk with zero confirmation delay. The latest
    /// leg may still revise, which is why these pivots are flagged.
    pub fn compute_preview_pivots(
        &self,
        highs: &[f64],
        lows: &[f64],
        reversal_amounts: &[f64],
    ) -> Vec<Pivot> {
        let preview = ZigZag {
            use_ema: self.use_ema,
            ema_length: self.ema_length,
            confirmation_bars: 0,
        };
        preview
            .compute_pivots(highs, lows, reversal_amounts)
            .into_iter()
            .map(|p| Pivot {
                is_preview: true,
                ..p
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zigzag_data() -> (Vec<f64>, Vec<f64>) {
        // 100→120→90→130→85
        let prices = [
            100., 105., 110., 115., 120., // up
            115., 110., 105., 100., 90., // down
            95., 100., 110., 120., 130., // up
            125., 115., 105., 95., 85., // down
        ];
        let highs: Vec<f64> = prices.iter().map(|p| p + 1.0).collect();
        let lows: Vec<f64> = prices.iter().map(|p| p - 1.0).collect();
        (highs, lows)
    }

    #[test]
    fn test_pivots_alternate() {
        let (highs, lows) = zigzag_data();
        let rev = vec![5.0; highs.len()];
        let zz = ZigZag::new(false, 5, 0);
        let pivots = zz.compute_pivots(&highs, &lows, &rev);
        assert!(pivots.len() >= 2);
        for w in pivots.windows(2) {
            assert_ne!(w[0].is_high, w[1].is_high);
        }
    }

    #[test]
    fn test_confirmation_detects_same_or_fewer() {
        let (highs, lows) = zigzag_data();
        let rev = vec![5.0; highs.len()];
        let no_cb = ZigZag::new(false, 5, 0).compute_pivots(&highs, &lows, &rev);
        let cb2 = ZigZag::new(false, 5, 2).compute_pivots(&highs, &lows, &rev);
        assert!(cb2.len() <= no_cb.len());
    }

    #[test]
    fn test_threshold_indexed_at_confirmed_bar() {
        // Huge thresholds on the final (future) bars must not block
        // pivots whose confirmed bars lie before them.
        let (highs, lows) = zigzag_data();
        let n = highs.len();
        let cb = 2;

        let rev = vec![5.0; n];
        let mut rev_biased = vec![5.0; n];
        for v in rev_biased[n - 3..].iter_mut() {
            *v = 99999.0;
        }

        let zz = ZigZag::new(false, 5, cb);
        let normal = zz.compute_pivots(&highs, &lows, &rev);
        let biased = zz.compute_pivots(&highs, &lows, &rev_biased);

        let early_normal: Vec<_> = normal.iter().filter(|p| p.bar_index < n - cb - 1).collect();
        let early_biased: Vec<_> = biased.iter().filter(|p| p.bar_index < n - cb - 1).collect();
        assert_eq!(early_normal.len(), early_biased.len());
    }

    #[test]
    fn test_preview_flagged() {
        let (highs, lows) = zigzag_data();
        let rev = vec![5.0; highs.len()];
        let zz = ZigZag::new(false, 5, 0);
        let previews = zz.compute_preview_pivots(&highs, &lows, &rev);
        assert!(!previews.is_empty());
        assert!(previews.iter().all(|p| p.is_preview));
    }

    #[test]
    fn test_empty_input() {
        let zz = ZigZag::new(false, 5, 0);
        assert!(zz.compute_pivots(&[], &[], &[]).is_empty());
    }
}
