//! Stop-loss / take-profit computation, trailing stop, breakeven and
//! the minimum-risk filter.
//!
//! Everything here is a pure decision over position state and market
//! data; the position manager applies the effects and persists them.

use crate::domain::market::Timeframe;
use crate::domain::trading::position::{AgentPosition, CloseReason, Side};

/// Timeframe-adaptive SL/TP parameters, selected by ≤-lookup on the
/// timeframe's minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TfRiskParams {
    pub rr_ratio: f64,
    pub atr_mult: f64,
    pub max_sl_pct: f64,
    pub fallback_sl_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailParams {
    /// ATRs the trailing SL sits behind the best price.
    pub atr_mult: f64,
    /// Multiples of the initial risk the price must travel before
    /// trailing engages (breakeven handles the first leg).
    pub activation_risk_mult: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlTp {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub tp2: f64,
}

/// Outcome of the wick-aware stop check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopHit {
    pub exit_price: f64,
    pub reason: CloseReason,
}

/// Trailing-stop evaluation: the best price always ratchets; the SL
/// only moves when it improves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailUpdate {
    pub new_best: f64,
    pub new_stop_loss: Option<f64>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct RiskManager;

impl RiskManager {
    const TF_PARAMS: [(i64, TfRiskParams); 6] = [
        (1, TfRiskParams { rr_ratio: 1.5, atr_mult: 1.0, max_sl_pct: 0.30, fallback_sl_pct: 0.50 }),
        (5, TfRiskParams { rr_ratio: 2.0, atr_mult: 1.2, max_sl_pct: 0.50, fallback_sl_pct: 0.80 }),
        (15, TfRiskParams { rr_ratio: 2.5, atr_mult: 1.3, max_sl_pct: 0.80, fallback_sl_pct: 1.20 }),
        (60, TfRiskParams { rr_ratio: 3.0, atr_mult: 1.5, max_sl_pct: 1.50, fallback_sl_pct: 2.00 }),
        (240, TfRiskParams { rr_ratio: 3.0, atr_mult: 1.5, max_sl_pct: 3.00, fallback_sl_pct: 3.00 }),
        (1440, TfRiskParams { rr_ratio: 3.0, atr_mult: 1.5, max_sl_pct: 5.00, fallback_sl_pct: 5.00 }),
    ];

    const TRAIL_PARAMS: [(i64, TrailParams); 6] = [
        (1, TrailParams { atr_mult: 0.8, activation_risk_mult: 1.0 }),
        (5, TrailParams { atr_mult: 1.0, activation_risk_mult: 1.0 }),
        (15, TrailParams { atr_mult: 1.2, activation_risk_mult: 1.5 }),
        (60, TrailParams { atr_mult: 1.5, activation_risk_mult: 1.5 }),
        (240, TrailParams { atr_mult: 1.5, activation_risk_mult: 2.0 }),
        (1440, TrailParams { atr_mult: 2.0, activation_risk_mult: 2.0 }),
    ];

    pub fn tf_params(timeframe: Timeframe) -> TfRiskParams {
        let minutes = timeframe.minutes();
        for (cap, params) in Self::TF_PARAMS {
            if minutes <= cap {
                return params;
            }
        }
        Self::TF_PARAMS[Self::TF_PARAMS.len() - 1].1
    }

    pub fn trail_params(timeframe: Timeframe) -> TrailParams {
        let minutes = timeframe.minutes();
        for (cap, params) in Self::TRAIL_PARAMS {
            if minutes <= cap {
                return params;
            }
        }
        Self::TRAIL_PARAMS[Self::TRAIL_PARAMS.len() - 1].1
    }

    /// SL from the previous opposite pivot when it sits on the loss
    /// side, else ATR-based, else the percentage fallback; capped at
    /// the timeframe's maximum SL distance. TP1 from the R:R ratio or
    /// a qualifying zone target, TP2 at 1.5× the TP1 distance.
    pub fn calculate_sl_tp(
        side: Side,
        entry_price: f64,
        pivot_price: Option<f64>,
        atr: Option<f64>,
        timeframe: Timeframe,
        zone_tp: Option<f64>,
    ) -> SlTp {
        let p = Self::tf_params(timeframe);

        let (sl, tp1, tp2) = match side {
            Side::Long => {
                let mut sl = match (pivot_price, atr) {
                    (Some(pivot), _) if pivot < entry_price => pivot,
                    (_, Some(atr)) => entry_price - p.atr_mult * atr,
                    _ => entry_price * (1.0 - p.fallback_sl_pct / 100.0),
                };

                let max_sl_dist = entry_price * (p.max_sl_pct / 100.0);
                if entry_price - sl > max_sl_dist {
                    sl = entry_price - max_sl_dist;
                }

                let risk = entry_price - sl;
                let default_tp = entry_price + p.rr_ratio * risk;

                let tp1 = match zone_tp {
                    Some(zone) if zone > entry_price && risk > 0.0 => {
                        if (zone - entry_price) / risk >= 1.0 {
                            zone
                        } else {
                            default_tp
                        }
                    }
                    _ => default_tp,
                };

                let tp2 = entry_price + 1.5 * (tp1 - entry_price);
                (sl, tp1, tp2)
            }
            Side::Short => {
                let mut sl = match (pivot_price, atr) {
                    (Some(pivot), _) if pivot > entry_price => pivot,
                    (_, Some(atr)) => entry_price + p.atr_mult * atr,
                    _ => entry_price * (1.0 + p.fallback_sl_pct / 100.0),
                };

                let max_sl_dist = entry_price * (p.max_sl_pct / 100.0);
                if sl - entry_price > max_sl_dist {
                    sl = entry_price + max_sl_dist;
                }

                let risk = sl - entry_price;
                let default_tp = entry_price - p.rr_ratio * risk;

                let tp1 = match zone_tp {
                    Some(zone) if zone < entry_price && risk > 0.0 => {
                        if (entry_price - zone) / risk >= 1.0 {
                            zone
                        } else {
                            default_tp
                        }
                    }
                    _ => default_tp,
                };

                let tp2 = entry_price - 1.5 * (entry_price - tp1);
                (sl, tp1, tp2)
            }
        };

        SlTp {
            stop_loss: round2(sl),
            take_profit: round2(tp1),
            tp2: round2(tp2),
        }
    }

    /// Per-timeframe floor on risk distance: two opposite reversals
    /// that sit closer than this make profitable exits impossible.
    pub fn min_risk_pct(timeframe: Timeframe) -> f64 {
        let minutes = timeframe.minutes();
        if minutes <= 5 {
            0.15
        } else if minutes <= 15 {
            0.25
        } else {
            0.40
        }
    }

    pub fn is_risk_too_small(entry_price: f64, stop_loss: f64, timeframe: Timeframe) -> bool {
        if entry_price <= 0.0 {
            return true;
        }
        let risk_pct = (entry_price - stop_loss).abs() / entry_price * 100.0;
        risk_pct < Self::min_risk_pct(timeframe)
    }

    /// Wick-aware stop check: the candle's low (LONG) or high (SHORT)
    /// touching the SL triggers; the fill is the SL level itself. If
    /// the SL has ratcheted past its original in the profit direction,
    /// the exit is a trailing stop.
    pub fn check_stop_loss(
        pos: &AgentPosition,
        current_price: f64,
        candle_low: Option<f64>,
        candle_high: Option<f64>,
    ) -> Option<StopHit> {
        let low = candle_low.unwrap_or(current_price);
        let high = candle_high.unwrap_or(current_price);

        let triggered = match pos.side {
            Side::Long => low <= pos.stop_loss,
            Side::Short => high >= pos.stop_loss,
        };
        if !triggered {
            return None;
        }

        let is_trailing = match pos.side {
            Side::Long => pos.stop_loss > pos.original_stop_loss,
            Side::Short => pos.stop_loss < pos.original_stop_loss,
        };

        Some(StopHit {
            exit_price: pos.stop_loss,
            reason: if is_trailing {
                CloseReason::TrailingStop
            } else {
                CloseReason::StopLoss
            },
        })
    }

    /// Move the SL to entry once unrealized profit covers the initial
    /// risk. Returns the new SL; `None` when not (or already) at
    /// breakeven.
    pub fn breakeven_trigger(pos: &AgentPosition, current_price: f64) -> Option<f64> {
        match pos.side {
            Side::Long if pos.stop_loss >= pos.entry_price => return None,
            Side::Short if pos.stop_loss <= pos.entry_price => return None,
            _ => {}
        }

        let risk = (pos.entry_price - pos.original_stop_loss).abs();
        if risk <= 0.0 {
            return None;
        }

        let profit = match pos.side {
            Side::Long => current_price - pos.entry_price,
            Side::Short => pos.entry_price - current_price,
        };

        if profit >= risk {
            Some(pos.entry_price)
        } else {
            None
        }
    }

    /// ATR trail behind the wick-aware best price. Active only after
    /// breakeven; the SL never moves against the position.
    pub fn trailing_update(
        pos: &AgentPosition,
        atr: f64,
        timeframe: Timeframe,
        current_price: f64,
        candle_low: Option<f64>,
        candle_high: Option<f64>,
    ) -> Option<TrailUpdate> {
        match pos.side {
            Side::Long if pos.stop_loss < pos.entry_price => return None,
            Side::Short if pos.stop_loss > pos.entry_price => return None,
            _ => {}
        }
        if atr <= 0.0 {
            return None;
        }

        let trail_distance = atr * Self::trail_params(timeframe).atr_mult;
        let prev_best = pos.best_price.unwrap_or(pos.entry_price);

        let (new_best, new_sl) = match pos.side {
            Side::Long => {
                let extreme = candle_high.unwrap_or(current_price);
                let best = prev_best.max(extreme);
                let candidate = round2(best - trail_distance);
                (best, (candidate > pos.stop_loss).then_some(candidate))
            }
            Side::Short => {
                let extreme = candle_low.unwrap_or(current_price);
                let best = prev_best.min(extreme);
                let candidate = round2(best + trail_distance);
                (best, (candidate < pos.stop_loss).then_some(candidate))
            }
        };

        Some(TrailUpdate {
            new_best,
            new_stop_loss: new_sl,
        })
    }

    /// Wick-aware TP touch.
    pub fn take_profit_hit(pos: &AgentPosition, current_price: f64, candle_low: Option<f64>, candle_high: Option<f64>) -> bool {
        let Some(tp) = pos.take_profit else {
            return false;
        };
        let low = candle_low.unwrap_or(current_price);
        let high = candle_high.unwrap_or(current_price);
        match pos.side {
            Side::Long => high >= tp,
            Side::Short => low <= tp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::position::PositionStatus;
    use chrono::Utc;

    fn position(side: Side, entry: f64, sl: f64, original_sl: f64) -> AgentPosition {
        AgentPosition {
            id: 1,
            agent_id: 1,
            symbol: "BTC/USDT".into(),
            side,
            entry_price: entry,
            exit_price: None,
            stop_loss: sl,
            original_stop_loss: original_sl,
            take_profit: None,
            tp2: None,
            quantity: 1.0,
            original_quantity: 1.0,
            invested_eur: 100.0,
            status: PositionStatus::Open,
            partial_closed: false,
            partial_pnl: None,
            best_price: None,
            entry_signal_time: None,
            entry_signal_is_bullish: None,
            exit_signal_id: None,
            pnl: None,
            pnl_percent: None,
            unrealized_pnl: None,
            unrealized_pnl_percent: None,
            current_price: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_tf_params_lookup() {
        assert_eq!(RiskManager::tf_params(Timeframe::OneMin).rr_ratio, 1.5);
        assert_eq!(RiskManager::tf_params(Timeframe::OneHour).max_sl_pct, 1.50);
        // 30m rounds up to the 1h bucket.
        assert_eq!(RiskManager::tf_params(Timeframe::ThirtyMin), RiskManager::tf_params(Timeframe::OneHour));
        // Above the table top, the daily row applies.
        assert_eq!(RiskManager::tf_params(Timeframe::OneWeek), RiskManager::tf_params(Timeframe::OneDay));
    }

    #[test]
    fn test_sl_from_pivot_long() {
        let r = RiskManager::calculate_sl_tp(Side::Long, 100.0, Some(99.0), Some(2.0), Timeframe::OneHour, None);
        assert_eq!(r.stop_loss, 99.0);
        // risk 1.0, R:R 3.0
        assert_eq!(r.take_profit, 103.0);
        assert_eq!(r.tp2, 104.5);
    }

    #[test]
    fn test_sl_cap_respected() {
        // Pivot far below entry: capped to 1.5% on 1h.
        let r = RiskManager::calculate_sl_tp(Side::Long, 100.0, Some(90.0), None, Timeframe::OneHour, None);
        assert_eq!(r.stop_loss, 98.5);
        let risk_pct = (100.0 - r.stop_loss) / 100.0 * 100.0;
        assert!(risk_pct <= RiskManager::tf_params(Timeframe::OneHour).max_sl_pct + 1e-9);
    }

    #[test]
    fn test_sl_fallback_pct_short() {
        let r = RiskManager::calculate_sl_tp(Side::Short, 100.0, None, None, Timeframe::OneHour, None);
        assert_eq!(r.stop_loss, 102.0);
        assert_eq!(r.take_profit, 94.0);
        assert_eq!(r.tp2, 91.0);
    }

    #[test]
    fn test_zone_tp_used_when_rr_sufficient() {
        // risk = 1.0; zone at 101.2 has R:R 1.2 → used.
        let r = RiskManager::calculate_sl_tp(Side::Long, 100.0, Some(99.0), None, Timeframe::OneHour, Some(101.2));
        assert_eq!(r.take_profit, 101.2);
        assert_eq!(r.tp2, 101.8);
    }

    #[test]
    fn test_zone_tp_ignored_when_rr_poor() {
        // zone at 100.5 has R:R 0.5 → default TP wins.
        let r = RiskManager::calculate_sl_tp(Side::Long, 100.0, Some(99.0), None, Timeframe::OneHour, Some(100.5));
        assert_eq!(r.take_profit, 103.0);
    }

    #[test]
    fn test_tp2_is_one_and_a_half_tp1_distances() {
        for side in [Side::Long, Side::Short] {
            let r = RiskManager::calculate_sl_tp(side, 200.0, None, Some(1.0), Timeframe::FourHour, None);
            let d1 = (r.take_profit - 200.0).abs();
            let d2 = (r.tp2 - 200.0).abs();
            assert!((d2 - 1.5 * d1).abs() < 0.011); // 2-decimal rounding
        }
    }

    #[test]
    fn test_risk_floor() {
        // 0.20% risk on 1h needs 0.40% → rejected.
        assert!(RiskManager::is_risk_too_small(100.0, 99.80, Timeframe::OneHour));
        assert!(!RiskManager::is_risk_too_small(100.0, 99.80, Timeframe::OneMin));
        assert!(!RiskManager::is_risk_too_small(100.0, 99.0, Timeframe::OneHour));
    }

    #[test]
    fn test_stop_loss_wick_hit_long() {
        let pos = position(Side::Long, 100.0, 95.0, 95.0);
        // Close stays above, the wick touches.
        let hit = RiskManager::check_stop_loss(&pos, 96.0, Some(94.8), Some(97.0)).unwrap();
        assert_eq!(hit.exit_price, 95.0);
        assert_eq!(hit.reason, CloseReason::StopLoss);

        assert!(RiskManager::check_stop_loss(&pos, 96.0, Some(95.5), Some(97.0)).is_none());
    }

    #[test]
    fn test_stop_loss_trailing_reason() {
        let mut pos = position(Side::Long, 100.0, 95.0, 95.0);
        pos.stop_loss = 103.0; // ratcheted past entry
        let hit = RiskManager::check_stop_loss(&pos, 103.0, Some(102.9), Some(104.0)).unwrap();
        assert_eq!(hit.reason, CloseReason::TrailingStop);
        assert_eq!(hit.exit_price, 103.0);
    }

    #[test]
    fn test_breakeven_triggers_at_one_risk() {
        let pos = position(Side::Long, 100.0, 95.0, 95.0);
        assert_eq!(RiskManager::breakeven_trigger(&pos, 104.9), None);
        assert_eq!(RiskManager::breakeven_trigger(&pos, 105.0), Some(100.0));

        // Already at breakeven → no-op.
        let pos = position(Side::Long, 100.0, 100.0, 95.0);
        assert_eq!(RiskManager::breakeven_trigger(&pos, 120.0), None);
    }

    #[test]
    fn test_trailing_requires_breakeven_first() {
        let pos = position(Side::Long, 100.0, 95.0, 95.0);
        assert!(RiskManager::trailing_update(&pos, 2.0, Timeframe::OneHour, 106.0, None, Some(106.0)).is_none());
    }

    #[test]
    fn test_trailing_ratchets_monotonically() {
        let mut pos = position(Side::Long, 100.0, 100.0, 95.0);
        pos.best_price = Some(100.0);

        // 1h trail = 1.5 × ATR 2.0 = 3.0 behind the wick high.
        let up = RiskManager::trailing_update(&pos, 2.0, Timeframe::OneHour, 106.0, Some(104.0), Some(107.0)).unwrap();
        assert_eq!(up.new_best, 107.0);
        assert_eq!(up.new_stop_loss, Some(104.0));

        pos.best_price = Some(up.new_best);
        pos.stop_loss = up.new_stop_loss.unwrap();

        // Price falls back: best holds, SL never retreats.
        let down = RiskManager::trailing_update(&pos, 2.0, Timeframe::OneHour, 104.5, Some(104.2), Some(105.0)).unwrap();
        assert_eq!(down.new_best, 107.0);
        assert_eq!(down.new_stop_loss, None);
    }

    #[test]
    fn test_take_profit_wick_hit() {
        let mut pos = position(Side::Long, 100.0, 95.0, 95.0);
        pos.take_profit = Some(115.0);
        assert!(RiskManager::take_profit_hit(&pos, 114.0, Some(110.0), Some(116.0)));
        assert!(!RiskManager::take_profit_hit(&pos, 114.0, Some(110.0), Some(114.9)));

        let mut pos = position(Side::Short, 100.0, 105.0, 105.0);
        pos.take_profit = Some(85.0);
        assert!(RiskManager::take_profit_hit(&pos, 86.0, Some(84.9), Some(88.0)));
    }
}
