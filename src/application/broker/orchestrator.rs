//! The per-agent execution cycle and the run-all scheduler entry.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::application::analysis_service::{AnalysisRequest, AnalysisService};
use crate::application::ingestion::IngestionService;
use crate::domain::ports::{DistributedStore, ExchangeAdapter};
use crate::domain::repositories::{
    AgentLogRepository, AgentRepository, OhlcvRepository, PositionRepository, SignalRepository,
};
use crate::domain::trading::{Agent, AgentPosition, CloseReason, Side};

use super::position_manager::PositionManager;
use super::signal_evaluator::SignalEvaluator;

/// Bars a closed position must have lived before the agent may re-open
/// in the opposite direction.
const WHIPSAW_MIN_GAP_BARS: i64 = 3;

/// TTL of the per-agent distributed cycle lock.
const CYCLE_LOCK_TTL_SECS: u64 = 120;

pub struct AgentOrchestrator {
    agents: Arc<dyn AgentRepository>,
    positions: Arc<dyn PositionRepository>,
    signals: Arc<dyn SignalRepository>,
    ohlcv: Arc<dyn OhlcvRepository>,
    logs: Arc<dyn AgentLogRepository>,
    kv: Arc<dyn DistributedStore>,
    exchange: Arc<dyn ExchangeAdapter>,
    ingestion: Arc<IngestionService>,
    analysis: Arc<AnalysisService>,
    evaluator: Arc<SignalEvaluator>,
    manager: Arc<PositionManager>,
}

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        positions: Arc<dyn PositionRepository>,
        signals: Arc<dyn SignalRepository>,
        ohlcv: Arc<dyn OhlcvRepository>,
        logs: Arc<dyn AgentLogRepository>,
        kv: Arc<dyn DistributedStore>,
        exchange: Arc<dyn ExchangeAdapter>,
        ingestion: Arc<IngestionService>,
        analysis: Arc<AnalysisService>,
        evaluator: Arc<SignalEvaluator>,
        manager: Arc<PositionManager>,
    ) -> Self {
        Self {
            agents,
            positions,
            signals,
            ohlcv,
            logs,
            kv,
            exchange,
            ingestion,
            analysis,
            evaluator,
            manager,
        }
    }

    // ── Core cycle ───────────────────────────────────────────

    /// One full cycle for one agent, exclusive across workers via the
    /// distributed cycle lock. A failure inside the cycle is logged as
    /// `CYCLE_ERROR` and never propagates to the scheduler.
    pub async fn run_agent_cycle(&self, agent: &Agent) -> Result<()> {
        let lock_name = format!("agent_cycle_lock:{}", agent.id);
        let Some(token) = self.kv.try_lock(&lock_name, CYCLE_LOCK_TTL_SECS).await? else {
            debug!(agent = %agent.name, "cycle already running in another worker, skipping");
            return Ok(());
        };

        let outcome = self.cycle_body(agent).await;
        if let Err(e) = &outcome {
            error!(agent = %agent.name, error = %e, "cycle error");
            let _ = self
                .logs
                .append(agent.id, "CYCLE_ERROR", json!({ "error": e.to_string() }))
                .await;
        }

        if let Err(e) = self.kv.unlock(&lock_name, &token).await {
            warn!(agent = %agent.name, error = %e, "failed to release cycle lock (TTL will expire it)");
        }
        Ok(())
    }

    async fn cycle_body(&self, agent: &Agent) -> Result<()> {
        info!(agent = %agent.name, symbol = %agent.symbol, timeframe = %agent.timeframe, "running cycle");

        // 0. Fresh OHLCV for the agent's own timeframe, throttled to
        //    roughly the candle interval.
        let fetch_key = format!("agent_fetch:{}:{}", agent.id, agent.timeframe);
        if self.kv.get(&fetch_key).await?.is_none() {
            match self
                .ingestion
                .fetch_and_store(&agent.symbol, agent.timeframe, agent.analysis_limit as usize, None)
                .await
            {
                Ok(count) => {
                    self.kv
                        .setex(&fetch_key, agent.timeframe.fetch_throttle_secs(), "1")
                        .await?;
                    info!(agent = %agent.name, bars = count, "fetched fresh bars");
                }
                Err(e) => warn!(agent = %agent.name, error = %e, "data fetch failed"),
            }
        }

        // 1. Refresh analysis on the agent's timeframe.
        if let Err(e) = self.analysis.run_analysis(&AnalysisRequest::from_agent(agent)).await {
            warn!(agent = %agent.name, error = %e, "analysis refresh failed");
        }

        // 1b. Refresh the higher timeframe (non-blocking on failure).
        if let Some(htf) = agent.timeframe.higher() {
            let htf_outcome: Result<()> = async {
                self.ingestion.fetch_and_store(&agent.symbol, htf, 500, None).await?;
                let mut request = AnalysisRequest::from_agent(agent);
                request.timeframe = htf;
                request.limit = 500;
                self.analysis.run_analysis(&request).await?;
                Ok(())
            }
            .await;
            if let Err(e) = htf_outcome {
                debug!(agent = %agent.name, htf = %htf, error = %e, "HTF refresh failed (non-blocking)");
            }
        }

        // 2. Open positions and current market state.
        let open_positions = self.positions.open_positions(agent.id).await?;

        let latest_bar = self.ohlcv.latest_bar(&agent.symbol, agent.timeframe).await?;
        let current_price = match latest_bar.map(|b| b.close) {
            Some(price) => price,
            None => match self.exchange.mid_price(&agent.symbol).await {
                Some(price) => price,
                None => {
                    warn!(agent = %agent.name, "cannot determine current price");
                    return Ok(());
                }
            },
        };
        let candle_low = latest_bar.map(|b| b.low);
        let candle_high = latest_bar.map(|b| b.high);

        // 3. Maintenance, strictly ordered: stop-loss → breakeven →
        //    trailing → take-profit → unrealized PnL.
        for pos in open_positions {
            let mut pos = pos;
            if self
                .manager
                .check_stop_loss(agent, &pos, current_price, candle_low, candle_high)
                .await?
            {
                continue;
            }
            self.manager.check_breakeven(agent, &mut pos, current_price).await?;
            self.manager
                .check_trailing_stop(agent, &mut pos, current_price, candle_low, candle_high)
                .await?;
            if self
                .manager
                .check_take_profit(agent, &mut pos, current_price, candle_low, candle_high)
                .await?
            {
                continue;
            }
            self.manager.update_unrealized_pnl(&mut pos, current_price).await?;
        }

        // 4. Signal branches on the post-maintenance state. A stop or
        //    TP exit above restored the balance in the store, so the
        //    branches must see a refreshed agent row, not the snapshot
        //    taken at cycle start.
        let agent = self.agents.get(agent.id).await?.unwrap_or_else(|| agent.clone());
        let open_positions = self.positions.open_positions(agent.id).await?;
        match open_positions.into_iter().next() {
            Some(pos) => self.handle_open_position(&agent, &pos, current_price).await,
            None => self.handle_no_position(&agent, current_price).await,
        }
    }

    // ── Position-open branch ─────────────────────────────────

    /// With a position open, only a fresh opposite reversal matters: it
    /// closes the position and, outside the whipsaw window, flips it.
    async fn handle_open_position(&self, agent: &Agent, pos: &AgentPosition, current_price: f64) -> Result<()> {
        let opposite_is_bullish = pos.side.opposite().is_bullish();

        let Some(opposite) = self
            .signals
            .latest_confirmed_for(&agent.symbol, agent.timeframe, opposite_is_bullish)
            .await?
        else {
            debug!(agent = %agent.name, side = %pos.side, "no opposite signal, keeping position");
            return Ok(());
        };

        if self.evaluator.is_stale(agent, &opposite, true) {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": Side::from_signal(opposite.is_bullish).as_str(),
                        "reason": "signal_stale",
                        "signal_time": opposite.time.to_rfc3339(),
                        "signal_price": opposite.price,
                        "entry_price": current_price,
                    }),
                )
                .await?;
            return Ok(());
        }

        if let Some(entry_time) = pos.entry_signal_time {
            if opposite.time <= entry_time {
                debug!(
                    agent = %agent.name,
                    signal_time = %opposite.time,
                    entry_time = %entry_time,
                    "opposite signal predates the entry, ignoring"
                );
                return Ok(());
            }
        }

        if self.evaluator.is_processed(agent.id, &opposite).await? {
            debug!(agent = %agent.name, signal_id = opposite.id, "opposite signal already processed");
            return Ok(());
        }

        let reason = if opposite.is_bullish {
            CloseReason::BullishReversal
        } else {
            CloseReason::BearishReversal
        };
        let closed = self
            .manager
            .close_position(pos, Some(current_price), Some(opposite.id), reason)
            .await?;
        if closed.is_none() {
            return Ok(()); // live close failed; retry next cycle
        }
        info!(agent = %agent.name, side = %pos.side, reason = reason.as_str(), "closed on opposite reversal");

        // ── Whipsaw cooldown ──
        let position_duration = (Utc::now() - pos.opened_at).num_seconds();
        let min_gap = WHIPSAW_MIN_GAP_BARS * agent.timeframe.seconds();
        if position_duration < min_gap {
            info!(
                agent = %agent.name,
                duration_s = position_duration,
                min_gap_s = min_gap,
                "position lived under the whipsaw window, skipping re-open"
            );
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": Side::from_signal(opposite.is_bullish).as_str(),
                        "reason": "whipsaw_cooldown",
                        "signal_time": opposite.time.to_rfc3339(),
                        "signal_price": opposite.price,
                        "entry_price": current_price,
                        "position_duration_s": position_duration,
                        "min_gap_s": min_gap,
                    }),
                )
                .await?;
            return Ok(());
        }

        // Flip: the close restored the balance, so re-read the agent.
        let agent = self.agents.get(agent.id).await?.unwrap_or_else(|| agent.clone());
        let new_side = Side::from_signal(opposite.is_bullish);
        if agent.balance <= 0.0 {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": new_side.as_str(),
                        "reason": "no_balance",
                        "signal_time": opposite.time.to_rfc3339(),
                        "signal_price": opposite.price,
                        "entry_price": current_price,
                        "balance": agent.balance,
                    }),
                )
                .await?;
            return Ok(());
        }

        self.manager
            .open_position(&agent, new_side, current_price, &opposite)
            .await?;
        Ok(())
    }

    // ── No-position branch ───────────────────────────────────

    async fn handle_no_position(&self, agent: &Agent, current_price: f64) -> Result<()> {
        let Some(signal) = self
            .signals
            .latest_confirmed(&agent.symbol, agent.timeframe)
            .await?
        else {
            debug!(agent = %agent.name, "no signals found, skipping");
            return Ok(());
        };

        if self.evaluator.is_stale(agent, &signal, false) {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": Side::from_signal(signal.is_bullish).as_str(),
                        "reason": "signal_stale",
                        "signal_time": signal.time.to_rfc3339(),
                        "signal_price": signal.price,
                        "entry_price": current_price,
                    }),
                )
                .await?;
            return Ok(());
        }

        if self.evaluator.is_processed(agent.id, &signal).await? {
            debug!(agent = %agent.name, signal_id = signal.id, "signal already processed");
            return Ok(());
        }

        let side = Side::from_signal(signal.is_bullish);
        if agent.balance <= 0.0 {
            self.logs
                .append(
                    agent.id,
                    "TRADE_SKIPPED",
                    json!({
                        "side": side.as_str(),
                        "reason": "no_balance",
                        "signal_time": signal.time.to_rfc3339(),
                        "signal_price": signal.price,
                        "entry_price": current_price,
                        "balance": agent.balance,
                    }),
                )
                .await?;
            return Ok(());
        }

        self.manager.open_position(agent, side, current_price, &signal).await?;
        Ok(())
    }

    // ── Scheduler entry-point ────────────────────────────────

    /// One cycle for every active agent, throttled per agent and
    /// isolated so one agent's failure cannot poison the next.
    pub async fn run_all_active_agents(&self) -> Result<()> {
        let active = self.agents.list_active().await?;
        if active.is_empty() {
            return Ok(());
        }

        let total = active.len();
        let mut ran = 0usize;
        for agent in active {
            let throttle_key = format!("agent_throttle:{}", agent.id);
            match self.kv.get(&throttle_key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(agent = %agent.name, error = %e, "throttle check failed, skipping agent");
                    continue;
                }
            }
            if let Err(e) = self
                .kv
                .setex(&throttle_key, agent.timeframe.cycle_throttle_secs(), "1")
                .await
            {
                warn!(agent = %agent.name, error = %e, "throttle set failed, skipping agent");
                continue;
            }

            if let Err(e) = self.run_agent_cycle(&agent).await {
                error!(agent = %agent.name, error = %e, "agent cycle failed");
            } else {
                ran += 1;
            }
        }

        if ran > 0 {
            info!(ran, total, "agent cycles executed");
        }
        Ok(())
    }
}
