//! Signal evaluation: staleness, duplicate detection and the trade
//! filters (EMA trend, same-TF pivot momentum, higher-TF confirmation).

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::domain::analysis::{StoredSignal, TrendState};
use crate::domain::market::Timeframe;
use crate::domain::repositories::{AnalysisRunRepository, PositionRepository, SignalRepository};
use crate::domain::trading::{Agent, Side};

pub struct SignalEvaluator {
    signals: Arc<dyn SignalRepository>,
    runs: Arc<dyn AnalysisRunRepository>,
    positions: Arc<dyn PositionRepository>,
}

impl SignalEvaluator {
    pub fn new(
        signals: Arc<dyn SignalRepository>,
        runs: Arc<dyn AnalysisRunRepository>,
        positions: Arc<dyn PositionRepository>,
    ) -> Self {
        Self {
            signals,
            runs,
            positions,
        }
    }

    // ── Staleness ────────────────────────────────────────────

    /// A signal is stale once its `detected_at` is older than the
    /// timeframe's candle budget. Lenient mode (used for closing
    /// decisions) doubles the budget. Signals without `detected_at`
    /// are assumed fresh.
    pub fn is_stale(&self, agent: &Agent, signal: &StoredSignal, lenient: bool) -> bool {
        let Some(detected_at) = signal.detected_at else {
            return false;
        };

        let elapsed = (Utc::now() - detected_at).num_seconds();
        let tf_seconds = agent.timeframe.seconds();
        let max_candles = agent.timeframe.staleness_budget_candles();
        let mut max_seconds = max_candles * tf_seconds;
        if lenient {
            max_seconds *= 2;
        }

        if elapsed > max_seconds {
            info!(
                agent = %agent.name,
                signal_id = signal.id,
                elapsed_s = elapsed,
                max_s = max_seconds,
                lenient,
                "signal is stale, skipping"
            );
            return true;
        }

        debug!(agent = %agent.name, signal_id = signal.id, elapsed_s = elapsed, "signal freshness OK");
        false
    }

    // ── Duplicate / already-processed ────────────────────────

    /// A signal counts as processed when any position of this agent
    /// carries its stable key. Signal ids churn across re-analysis;
    /// the key never does.
    pub async fn is_processed(&self, agent_id: i64, signal: &StoredSignal) -> Result<bool> {
        let count = self
            .positions
            .count_signal_key(agent_id, signal.time, signal.is_bullish)
            .await?;
        Ok(count > 0)
    }

    // ── EMA trend filter ─────────────────────────────────────

    /// Block LONG against a BEARISH trend, SHORT against BULLISH;
    /// NEUTRAL (or no analysis yet) passes.
    pub async fn is_ema_trend_against(
        &self,
        agent_name: &str,
        symbol: &str,
        timeframe: Timeframe,
        side: Side,
    ) -> Result<bool> {
        let Some(run) = self.runs.latest(symbol, timeframe).await? else {
            return Ok(false);
        };
        let Some(trend) = run.current_trend else {
            return Ok(false);
        };

        let against = matches!(
            (side, trend),
            (Side::Long, TrendState::Bearish) | (Side::Short, TrendState::Bullish)
        );
        if against {
            info!(
                agent = agent_name,
                %side,
                trend = trend.as_str(),
                timeframe = %timeframe,
                "skipping: EMA trend is against the trade"
            );
        }
        Ok(against)
    }

    // ── Pivot momentum filter (same TF) ──────────────────────

    /// Three strictly monotone opposite-direction pivots mean the swing
    /// structure still runs against the trade: lower highs block LONG,
    /// higher lows block SHORT.
    pub async fn is_pivot_momentum_against(
        &self,
        agent_name: &str,
        symbol: &str,
        timeframe: Timeframe,
        side: Side,
    ) -> Result<bool> {
        // For LONG, inspect bearish pivots (swing highs); for SHORT,
        // bullish pivots (swing lows).
        let check_bullish = side == Side::Short;
        let prices = self
            .signals
            .recent_confirmed_prices(symbol, timeframe, check_bullish, 3)
            .await?;

        if prices.len() < 3 {
            return Ok(false);
        }
        let (newest, middle, oldest) = (prices[0], prices[1], prices[2]);

        let against = match side {
            Side::Long => newest < middle && middle < oldest,
            Side::Short => newest > middle && middle > oldest,
        };
        if against {
            info!(
                agent = agent_name,
                %side,
                newest,
                middle,
                oldest,
                "skipping: pivot momentum runs against the trade"
            );
        }
        Ok(against)
    }

    // ── Higher-timeframe trend confirmation ──────────────────

    /// Relaxed HTF confirmation: among the three most recent same-side
    /// HTF pivots, at least one of the two consecutive pairs must
    /// confirm the direction. With only two pivots and the pair
    /// refuting, or fewer than two, fall back to the HTF EMA filter.
    pub async fn is_htf_trend_against(
        &self,
        agent_name: &str,
        symbol: &str,
        timeframe: Timeframe,
        side: Side,
    ) -> Result<bool> {
        let Some(htf) = timeframe.higher() else {
            return Ok(false);
        };

        let same_side_bullish = side == Side::Long;
        let prices = self
            .signals
            .recent_confirmed_prices(symbol, htf, same_side_bullish, 3)
            .await?;

        if prices.len() >= 3 {
            let (newest, middle, oldest) = (prices[0], prices[1], prices[2]);
            let confirms = match side {
                // Higher lows confirm LONG.
                Side::Long => (newest > middle) as u32 + (middle > oldest) as u32,
                // Lower highs confirm SHORT.
                Side::Short => (newest < middle) as u32 + (middle < oldest) as u32,
            };
            if confirms >= 1 {
                debug!(
                    agent = agent_name,
                    %side,
                    htf = %htf,
                    confirms,
                    "HTF pivots confirm the direction"
                );
                Ok(false)
            } else {
                info!(
                    agent = agent_name,
                    %side,
                    htf = %htf,
                    newest,
                    middle,
                    oldest,
                    "skipping: every HTF pivot pair refutes the direction"
                );
                Ok(true)
            }
        } else if prices.len() == 2 {
            let refutes = match side {
                Side::Long => prices[0] < prices[1],
                Side::Short => prices[0] > prices[1],
            };
            if refutes {
                self.is_ema_trend_against(agent_name, symbol, htf, side).await
            } else {
                Ok(false)
            }
        } else {
            self.is_ema_trend_against(agent_name, symbol, htf, side).await
        }
    }
}
