//! Position lifecycle: open (filters + guarded insert), close (full,
//! partial and manual), stop/breakeven/trailing maintenance and
//! unrealized PnL accounting.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};

use crate::domain::analysis::StoredSignal;
use crate::domain::errors::TradeError;
use crate::domain::market::Timeframe;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::repositories::{
    AgentLogRepository, AgentRepository, AnalysisRunRepository, OhlcvRepository, PositionRepository,
    SignalRepository, ZoneRepository,
};
use crate::domain::trading::position::NewPosition;
use crate::domain::trading::{Agent, AgentMode, AgentPosition, CloseReason, Side};

use super::risk_manager::RiskManager;
use super::signal_evaluator::SignalEvaluator;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

pub struct PositionManager {
    agents: Arc<dyn AgentRepository>,
    positions: Arc<dyn PositionRepository>,
    signals: Arc<dyn SignalRepository>,
    zones: Arc<dyn ZoneRepository>,
    runs: Arc<dyn AnalysisRunRepository>,
    ohlcv: Arc<dyn OhlcvRepository>,
    logs: Arc<dyn AgentLogRepository>,
    exchange: Arc<dyn ExchangeAdapter>,
    evaluator: Arc<SignalEvaluator>,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        positions: Arc<dyn PositionRepository>,
        signals: Arc<dyn SignalRepository>,
        zones: Arc<dyn ZoneRepository>,
        runs: Arc<dyn AnalysisRunRepository>,
        ohlcv: Arc<dyn OhlcvRepository>,
        logs: Arc<dyn AgentLogRepository>,
        exchange: Arc<dyn ExchangeAdapter>,
        evaluator: Arc<SignalEvaluator>,
    ) -> Self {
        Self {
            agents,
            positions,
            signals,
            zones,
            runs,
            ohlcv,
            logs,
            exchange,
            evaluator,
        }
    }

    async fn current_atr(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<f64>> {
        Ok(self
            .runs
            .latest(symbol, timeframe)
            .await?
            .map(|run| run.current_atr)
            .filter(|atr| *atr > 0.0))
    }

    // ── Open ─────────────────────────────────────────────────

    /// Run the filter stack, execute the order and insert the position
    /// under the balance / open-count guards. Returns `None` when a
    /// filter rejected the trade or a guard lost the race; every
    /// rejection leaves a `TRADE_SKIPPED` log with a machine-readable
    /// reason.
    pub async fn open_position(
        &self,
        agent: &Agent,
        side: Side,
        current_price: f64,
        signal: &StoredSignal,
    ) -> Result<Option<AgentPosition>> {
        let symbol = agent.symbol.as_str();
        let timeframe = agent.timeframe;
        let signal_time = signal.time.to_rfc3339();

        let pivot_price = self
            .signals
            .previous_confirmed_pivot(symbol, timeframe, !side.is_bullish(), chrono::Utc::now())
            .await?;
        let atr = self.current_atr(symbol, timeframe).await?;
        let zone_tp = self
            .zones
            .zone_tp(symbol, timeframe, side == Side::Long, current_price)
            .await?;

        let sltp = RiskManager::calculate_sl_tp(side, current_price, pivot_price, atr, timeframe, zone_tp);

        // ── Risk floor ──
        if RiskManager::is_risk_too_small(current_price, sltp.stop_loss, timeframe) {
            info!(
                agent = %agent.name,
                %side,
                entry = current_price,
                stop_loss = sltp.stop_loss,
                "skipping: risk below the timeframe floor"
            );
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": side.as_str(),
                        "reason": "risk_too_small",
                        "signal_time": signal_time,
                        "entry_price": current_price,
                        "stop_loss": sltp.stop_loss,
                        "risk_pct": round4((current_price - sltp.stop_loss).abs() / current_price * 100.0),
                    }),
                )
                .await?;
            return Ok(None);
        }

        // ── Pivot momentum (same TF) ──
        if self
            .evaluator
            .is_pivot_momentum_against(&agent.name, symbol, timeframe, side)
            .await?
        {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": side.as_str(),
                        "reason": "pivot_momentum_against",
                        "signal_time": signal_time,
                        "entry_price": current_price,
                    }),
                )
                .await?;
            return Ok(None);
        }

        // ── Higher-timeframe trend ──
        if self
            .evaluator
            .is_htf_trend_against(&agent.name, symbol, timeframe, side)
            .await?
        {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": side.as_str(),
                        "reason": "htf_trend_against",
                        "signal_time": signal_time,
                        "entry_price": current_price,
                        "htf_checked": timeframe.higher().map(|h| h.as_str()),
                    }),
                )
                .await?;
            return Ok(None);
        }

        // ── EMA trend (same TF) ──
        if self
            .evaluator
            .is_ema_trend_against(&agent.name, symbol, timeframe, side)
            .await?
        {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": side.as_str(),
                        "reason": "ema_trend_against",
                        "signal_time": signal_time,
                        "entry_price": current_price,
                    }),
                )
                .await?;
            return Ok(None);
        }

        // ── Execute ──
        let trade_amount = agent.balance;
        let order = self
            .exchange
            .market_open(symbol, side, trade_amount, current_price, agent.mode)
            .await;

        if !order.success {
            error!(
                agent = %agent.name,
                %side,
                error = order.error.as_deref().unwrap_or("unknown"),
                "open order failed"
            );
            self.logs
                .append(
                    agent.id,
                    "ORDER_FAILED",
                    json!({
                        "side": side.as_str(),
                        "error": order.error,
                    }),
                )
                .await?;
            return Ok(None);
        }

        let entry_price = order.filled_price.unwrap_or(current_price);
        let quantity = order.quantity.unwrap_or(trade_amount / current_price);

        let new_position = NewPosition {
            agent_id: agent.id,
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_loss: sltp.stop_loss,
            take_profit: sltp.take_profit,
            tp2: sltp.tp2,
            quantity,
            invested_eur: trade_amount,
            entry_signal_time: signal.time,
            entry_signal_is_bullish: signal.is_bullish,
        };

        let Some(position) = self.positions.try_open(&new_position).await? else {
            warn!(agent = %agent.name, "open guard failed (balance spent or position already open), skipping");
            return Ok(None);
        };

        let risk = (entry_price - sltp.stop_loss).abs();
        let reward = (sltp.take_profit - entry_price).abs();
        let reward2 = (sltp.tp2 - entry_price).abs();
        info!(
            agent = %agent.name,
            %side,
            entry = entry_price,
            stop_loss = sltp.stop_loss,
            take_profit = sltp.take_profit,
            tp2 = sltp.tp2,
            quantity,
            "position opened"
        );
        self.logs
            .append(
                agent.id,
                "POSITION_OPENED",
                json!({
                    "position_id": position.id,
                    "side": side.as_str(),
                    "entry_price": entry_price,
                    "stop_loss": sltp.stop_loss,
                    "take_profit_1": sltp.take_profit,
                    "take_profit_2": sltp.tp2,
                    "zone_tp_used": zone_tp.is_some(),
                    "quantity": quantity,
                    "risk": round2(risk),
                    "reward_tp1": round2(reward),
                    "reward_tp2": round2(reward2),
                    "rr_ratio_tp1": if risk > 0.0 { round2(reward / risk) } else { 0.0 },
                    "rr_ratio_tp2": if risk > 0.0 { round2(reward2 / risk) } else { 0.0 },
                    "mode": agent.mode.as_str(),
                    "is_paper": order.is_paper,
                }),
            )
            .await?;

        Ok(Some(position))
    }

    // ── Close ────────────────────────────────────────────────

    /// Close the remaining quantity. Returns the closed position, or
    /// `None` when a live-mode close failed and the position must stay
    /// open. PnL is computed in USDT, converted once to EUR, and the
    /// agent balance is restored as `invested_eur + total_pnl_eur` —
    /// never by re-converting the engaged capital.
    pub async fn close_position(
        &self,
        pos: &AgentPosition,
        exit_price: Option<f64>,
        exit_signal_id: Option<i64>,
        reason: CloseReason,
    ) -> Result<Option<AgentPosition>> {
        let agent = self
            .agents
            .get(pos.agent_id)
            .await?
            .ok_or(TradeError::AgentNotFound { id: pos.agent_id })?;

        // No exit price from the caller: use the latest stored market
        // price, not the entry, so out-of-cycle closes still report a
        // real PnL.
        let exit_price = match exit_price {
            Some(price) => price,
            None => self
                .ohlcv
                .latest_bar(&pos.symbol, Timeframe::OneHour)
                .await?
                .map(|bar| bar.close)
                .unwrap_or(pos.entry_price),
        };

        let order = self
            .exchange
            .market_close(&pos.symbol, pos.side, pos.quantity, exit_price, agent.mode)
            .await;

        if !order.success {
            if agent.mode == AgentMode::Live {
                error!(
                    agent = %agent.name,
                    position_id = pos.id,
                    error = order.error.as_deref().unwrap_or("unknown"),
                    "live close failed, position stays open"
                );
                self.logs
                    .append(
                        pos.agent_id,
                        "ORDER_FAILED",
                        json!({
                            "action": "close",
                            "position_id": pos.id,
                            "side": pos.side.as_str(),
                            "error": order.error,
                        }),
                    )
                    .await?;
                return Ok(None);
            }
            warn!(
                agent = %agent.name,
                position_id = pos.id,
                "paper close failed, proceeding with estimated exit"
            );
        }

        let actual_exit = if order.success {
            order.filled_price.unwrap_or(exit_price)
        } else {
            exit_price
        };

        let (pnl_usdt, pnl_pct) = match pos.side {
            Side::Long => (
                (actual_exit - pos.entry_price) * pos.quantity,
                (actual_exit - pos.entry_price) / pos.entry_price * 100.0,
            ),
            Side::Short => (
                (pos.entry_price - actual_exit) * pos.quantity,
                (pos.entry_price - actual_exit) / pos.entry_price * 100.0,
            ),
        };

        let pnl_eur = self.exchange.usdt_to_eur(pnl_usdt).await;
        let total_pnl_eur = pnl_eur + pos.partial_pnl.unwrap_or(0.0);
        let new_balance = round2(pos.invested_eur + total_pnl_eur);

        let mut closed = pos.clone();
        closed.exit_price = Some(actual_exit);
        closed.pnl = Some(round4(total_pnl_eur));
        closed.pnl_percent = Some(round2(pnl_pct));
        closed.status = reason.final_status();
        closed.exit_signal_id = exit_signal_id;
        closed.closed_at = Some(chrono::Utc::now());

        self.positions.close(&closed, reason, new_balance).await?;

        info!(
            agent = %agent.name,
            position_id = pos.id,
            side = %pos.side,
            entry = pos.entry_price,
            exit = actual_exit,
            pnl_eur = closed.pnl,
            reason = reason.as_str(),
            "position closed"
        );
        self.logs
            .append(
                pos.agent_id,
                &format!("POSITION_{}", closed.status.as_str()),
                json!({
                    "position_id": pos.id,
                    "side": pos.side.as_str(),
                    "entry_price": pos.entry_price,
                    "exit_price": actual_exit,
                    "pnl": closed.pnl,
                    "pnl_percent": closed.pnl_percent,
                    "reason": reason.as_str(),
                }),
            )
            .await?;

        Ok(Some(closed))
    }

    /// Close an open position outside the agent cycle (admin surface).
    pub async fn close_manually(&self, position_id: i64) -> Result<Option<AgentPosition>> {
        let pos = self
            .positions
            .get(position_id)
            .await?
            .ok_or(TradeError::PositionNotFound { id: position_id })?;
        if pos.status != crate::domain::trading::PositionStatus::Open {
            return Ok(None);
        }
        self.close_position(&pos, None, None, CloseReason::ManualClose).await
    }

    // ── Maintenance checks (called once per cycle, in order) ──

    /// Wick-aware stop check; closes at the SL level on a hit.
    pub async fn check_stop_loss(
        &self,
        agent: &Agent,
        pos: &AgentPosition,
        current_price: f64,
        candle_low: Option<f64>,
        candle_high: Option<f64>,
    ) -> Result<bool> {
        let Some(hit) = RiskManager::check_stop_loss(pos, current_price, candle_low, candle_high) else {
            return Ok(false);
        };

        info!(
            agent = %agent.name,
            position_id = pos.id,
            side = %pos.side,
            stop_loss = pos.stop_loss,
            original_stop_loss = pos.original_stop_loss,
            exit = hit.exit_price,
            reason = hit.reason.as_str(),
            "stop triggered"
        );
        let closed = self
            .close_position(pos, Some(hit.exit_price), None, hit.reason)
            .await?;
        Ok(closed.is_some())
    }

    /// Move the SL to entry once profit covers the initial risk.
    pub async fn check_breakeven(&self, agent: &Agent, pos: &mut AgentPosition, current_price: f64) -> Result<bool> {
        let Some(new_sl) = RiskManager::breakeven_trigger(pos, current_price) else {
            return Ok(false);
        };

        let old_sl = pos.stop_loss;
        pos.stop_loss = new_sl;
        self.positions.save(pos).await?;

        info!(
            agent = %agent.name,
            position_id = pos.id,
            side = %pos.side,
            old_sl,
            new_sl,
            price = current_price,
            "breakeven activated"
        );
        self.logs
            .append(
                agent.id,
                "BREAKEVEN_ACTIVATED",
                json!({
                    "position_id": pos.id,
                    "side": pos.side.as_str(),
                    "old_sl": old_sl,
                    "new_sl": new_sl,
                    "current_price": current_price,
                    "risk": round2((pos.entry_price - pos.original_stop_loss).abs()),
                }),
            )
            .await?;
        Ok(true)
    }

    /// Ratchet the trailing stop behind the wick-aware best price.
    pub async fn check_trailing_stop(
        &self,
        agent: &Agent,
        pos: &mut AgentPosition,
        current_price: f64,
        candle_low: Option<f64>,
        candle_high: Option<f64>,
    ) -> Result<bool> {
        let Some(atr) = self.current_atr(&agent.symbol, agent.timeframe).await? else {
            return Ok(false);
        };
        let Some(update) =
            RiskManager::trailing_update(pos, atr, agent.timeframe, current_price, candle_low, candle_high)
        else {
            return Ok(false);
        };

        let best_changed = pos.best_price != Some(update.new_best);
        pos.best_price = Some(update.new_best);

        let Some(new_sl) = update.new_stop_loss else {
            if best_changed {
                self.positions.save(pos).await?;
            }
            return Ok(false);
        };

        let old_sl = pos.stop_loss;
        pos.stop_loss = new_sl;
        self.positions.save(pos).await?;

        info!(
            agent = %agent.name,
            position_id = pos.id,
            side = %pos.side,
            old_sl,
            new_sl,
            best_price = update.new_best,
            atr,
            "trailing stop updated"
        );
        self.logs
            .append(
                agent.id,
                "TRAILING_STOP_UPDATED",
                json!({
                    "position_id": pos.id,
                    "side": pos.side.as_str(),
                    "old_sl": old_sl,
                    "new_sl": new_sl,
                    "best_price": update.new_best,
                    "atr": round2(atr),
                    "current_price": current_price,
                }),
            )
            .await?;
        Ok(true)
    }

    // ── Two-stage take profit ────────────────────────────────

    /// First TP1 touch closes exactly half, moves the SL to entry and
    /// advances the target to TP2; the second touch closes the rest.
    /// Returns `true` when the position fully closed.
    pub async fn check_take_profit(
        &self,
        agent: &Agent,
        pos: &mut AgentPosition,
        current_price: f64,
        candle_low: Option<f64>,
        candle_high: Option<f64>,
    ) -> Result<bool> {
        if !RiskManager::take_profit_hit(pos, current_price, candle_low, candle_high) {
            return Ok(false);
        }
        let Some(tp) = pos.take_profit else {
            return Ok(false);
        };

        if !pos.partial_closed {
            if let Some(tp2) = pos.tp2 {
                let partial_qty = pos.quantity / 2.0;

                let partial_pnl_usdt = match pos.side {
                    Side::Long => (tp - pos.entry_price) * partial_qty,
                    Side::Short => (pos.entry_price - tp) * partial_qty,
                };
                let partial_pnl_eur = self.exchange.usdt_to_eur(partial_pnl_usdt).await;

                let order = self
                    .exchange
                    .market_close(&pos.symbol, pos.side, partial_qty, tp, agent.mode)
                    .await;

                if !order.success && agent.mode == AgentMode::Live {
                    error!(
                        agent = %agent.name,
                        position_id = pos.id,
                        error = order.error.as_deref().unwrap_or("unknown"),
                        "live partial TP close failed, skipping partial"
                    );
                    self.logs
                        .append(
                            agent.id,
                            "ORDER_FAILED",
                            json!({
                                "action": "partial_tp",
                                "position_id": pos.id,
                                "side": pos.side.as_str(),
                                "error": order.error,
                            }),
                        )
                        .await?;
                    return Ok(false);
                }

                pos.quantity -= partial_qty;
                pos.partial_closed = true;
                pos.partial_pnl = Some(round4(partial_pnl_eur));
                pos.stop_loss = pos.entry_price;
                pos.take_profit = Some(tp2);
                self.positions.save(pos).await?;

                info!(
                    agent = %agent.name,
                    position_id = pos.id,
                    side = %pos.side,
                    tp1 = tp,
                    partial_qty,
                    remaining = pos.quantity,
                    partial_pnl_eur,
                    new_tp = tp2,
                    "partial TP1 taken, SL at breakeven"
                );
                self.logs
                    .append(
                        agent.id,
                        "PARTIAL_TP_CLOSED",
                        json!({
                            "position_id": pos.id,
                            "side": pos.side.as_str(),
                            "tp1_price": tp,
                            "partial_qty": partial_qty,
                            "remaining_qty": pos.quantity,
                            "partial_pnl_eur": round4(partial_pnl_eur),
                            "new_sl": pos.entry_price,
                            "new_tp": tp2,
                        }),
                    )
                    .await?;

                return Ok(false); // other half keeps running
            }
        }

        let reason = if pos.partial_closed {
            CloseReason::TakeProfit2
        } else {
            CloseReason::TakeProfit
        };
        let closed = self.close_position(pos, Some(tp), None, reason).await?;
        Ok(closed.is_some())
    }

    // ── Unrealized PnL ───────────────────────────────────────

    pub async fn update_unrealized_pnl(&self, pos: &mut AgentPosition, current_price: f64) -> Result<()> {
        let (pnl_usdt, pnl_pct) = match pos.side {
            Side::Long => (
                (current_price - pos.entry_price) * pos.quantity,
                (current_price - pos.entry_price) / pos.entry_price * 100.0,
            ),
            Side::Short => (
                (pos.entry_price - current_price) * pos.quantity,
                (pos.entry_price - current_price) / pos.entry_price * 100.0,
            ),
        };

        let pnl_eur = self.exchange.usdt_to_eur(pnl_usdt).await;
        pos.unrealized_pnl = Some(round4(pnl_eur));
        pos.unrealized_pnl_percent = Some(round2(pnl_pct));
        pos.current_price = Some(current_price);
        self.positions.save(pos).await
    }
}
