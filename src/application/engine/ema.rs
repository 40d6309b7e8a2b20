//! EMA computation and the triple-EMA trend state machine.

use crate::domain::analysis::{TrendInfo, TrendState};

/// Standard EMA seeded with the SMA of the first `period` bars; NaN
/// before the seed. With fewer bars than `period`, only the last value
/// is filled with the mean of what is available.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    let n = data.len();
    let mut out = vec![f64::NAN; n];
    if n == 0 || period == 0 {
        return out;
    }

    let alpha = 2.0 / (period as f64 + 1.0);

    if n >= period {
        let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
        out[period - 1] = seed;
        for i in period..n {
            out[i] = alpha * data[i] + (1.0 - alpha) * out[i - 1];
        }
    } else {
        out[n - 1] = data.iter().sum::<f64>() / n as f64;
    }

    out
}

#[derive(Debug, Default)]
struct EmaState {
    buy_signal: i32,
    sell_signal: i32,
    prev_buy: bool,
    prev_sell: bool,
    prev_buy_signal: i32,
    prev_sell_signal: i32,
}

/// Per-bar trend classification.
///
/// BULLISH while EMA9 > EMA14 > EMA21 with lows above EMA9, BEARISH in
/// the mirror case, NEUTRAL otherwise. The `trend_changed_to_*` flags
/// fire only on the bar where the state flips.
pub fn compute_trend(
    closes: &[f64],
    highs: &[f64],
    lows: &[f64],
    fast: usize,
    mid: usize,
    slow: usize,
) -> Vec<TrendInfo> {
    let n = closes.len();
    let e_fast = ema(closes, fast);
    let e_mid = ema(closes, mid);
    let e_slow = ema(closes, slow);

    let mut state = EmaState::default();
    let mut trends = Vec::with_capacity(n);

    for i in 0..n {
        let e9 = e_fast[i];
        let e14 = e_mid[i];
        let e21 = e_slow[i];

        if e9.is_nan() || e14.is_nan() || e21.is_nan() {
            trends.push(TrendInfo {
                state: TrendState::Neutral,
                ema_fast: if e9.is_nan() { 0.0 } else { e9 },
                ema_mid: if e14.is_nan() { 0.0 } else { e14 },
                ema_slow: if e21.is_nan() { 0.0 } else { e21 },
                buy_signal: false,
                sell_signal: false,
                trend_changed_to_bullish: false,
                trend_changed_to_bearish: false,
            });
            continue;
        }

        let buy = e9 > e14 && e14 > e21 && lows[i] > e9;
        let stop_buy = e9 <= e14;
        let buy_now = buy && !state.prev_buy;

        if buy_now && !stop_buy {
            state.buy_signal = 1;
        } else if state.buy_signal == 1 && stop_buy {
            state.buy_signal = 0;
        }

        let sell = e9 < e14 && e14 < e21 && highs[i] < e9;
        let stop_sell = e9 >= e14;
        let sell_now = sell && !state.prev_sell;

        if sell_now && !stop_sell {
            state.sell_signal = 1;
        } else if state.sell_signal == 1 && stop_sell {
            state.sell_signal = 0;
        }

        let trend_state = if state.buy_signal == 1 {
            TrendState::Bullish
        } else if state.sell_signal == 1 {
            TrendState::Bearish
        } else {
            TrendState::Neutral
        };

        trends.push(TrendInfo {
            state: trend_state,
            ema_fast: e9,
            ema_mid: e14,
            ema_slow: e21,
            buy_signal: buy_now,
            sell_signal: sell_now,
            trend_changed_to_bullish: state.buy_signal == 1 && state.prev_buy_signal != 1,
            trend_changed_to_bearish: state.sell_signal == 1 && state.prev_sell_signal != 1,
        });

        state.prev_buy = buy;
        state.prev_sell = sell;
        state.prev_buy_signal = state.buy_signal;
        state.prev_sell_signal = state.sell_signal;
    }

    trends
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| a + (b - a) * i as f64 / (n as f64 - 1.0))
            .collect()
    }

    #[test]
    fn test_ema_basic() {
        let data: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let e = ema(&data, 3);
        assert!(e[0].is_nan());
        assert!(e[1].is_nan());
        assert!((e[2] - 2.0).abs() < 1e-12);
        for i in 3..data.len() {
            assert!(e[i] > e[i - 1]);
        }
    }

    #[test]
    fn test_ema_insufficient_data() {
        let e = ema(&[5.0, 10.0], 5);
        assert!(e[0].is_nan());
        assert!((e[1] - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_ema_empty() {
        assert!(ema(&[], 3).is_empty());
    }

    #[test]
    fn test_trend_bullish_on_steady_rise() {
        let closes = linspace(100.0, 200.0, 50);
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let trends = compute_trend(&closes, &highs, &lows, 9, 14, 21);
        assert_eq!(trends.len(), 50);
        assert_eq!(trends.last().unwrap().state, TrendState::Bullish);
    }

    #[test]
    fn test_trend_bearish_on_steady_fall() {
        let closes = linspace(200.0, 100.0, 50);
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let trends = compute_trend(&closes, &highs, &lows, 9, 14, 21);
        assert_eq!(trends.last().unwrap().state, TrendState::Bearish);
    }

    #[test]
    fn test_trend_change_fires_once_per_flip() {
        let mut closes = linspace(100.0, 200.0, 40);
        closes.extend(linspace(200.0, 100.0, 40));
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let trends = compute_trend(&closes, &highs, &lows, 9, 14, 21);

        let bullish_flips = trends.iter().filter(|t| t.trend_changed_to_bullish).count();
        let bearish_flips = trends.iter().filter(|t| t.trend_changed_to_bearish).count();
        assert!(bullish_flips <= 2);
        assert!(bearish_flips <= 2);
    }
}
