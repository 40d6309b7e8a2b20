//! Repository traits separating the broker and analysis services from
//! the storage backend. SQLite implementations live in
//! `infrastructure::persistence`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::analysis::{AnalysisRunRecord, IndicatorRow, NewSignal, NewZone, StoredSignal};
use crate::domain::market::{OhlcvBar, Timeframe};
use crate::domain::trading::{Agent, AgentPosition, CloseReason, NewAgent, NewPosition};

/// Persistent, time-keyed candle store per (symbol, timeframe).
#[async_trait]
pub trait OhlcvRepository: Send + Sync {
    /// Upsert bars keyed by (time, symbol, timeframe). Returns the
    /// number of bars written.
    async fn upsert_bars(&self, symbol: &str, timeframe: Timeframe, bars: &[OhlcvBar]) -> Result<usize>;

    /// The most recent `limit` bars, returned in chronological order.
    async fn recent_bars(&self, symbol: &str, timeframe: Timeframe, limit: i64) -> Result<Vec<OhlcvBar>>;

    /// Latest bar for the pair, if any.
    async fn latest_bar(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<OhlcvBar>>;
}

/// Persisted reversal signals.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// All signals for a pair (any direction, any preview flag).
    async fn list(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<StoredSignal>>;

    /// Upsert keyed by (time, symbol, timeframe, is_bullish);
    /// `detected_at` keeps the existing value when present.
    async fn upsert(&self, symbol: &str, timeframe: Timeframe, signals: &[NewSignal]) -> Result<()>;

    /// Delete specific rows (stale-signal pruning).
    async fn delete_ids(&self, ids: &[i64]) -> Result<()>;

    /// Delete every signal of a pair.
    async fn delete_pair(&self, symbol: &str, timeframe: Timeframe) -> Result<()>;

    /// Most recent confirmed signal of any direction.
    async fn latest_confirmed(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<StoredSignal>>;

    /// Most recent confirmed signal of one direction.
    async fn latest_confirmed_for(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
    ) -> Result<Option<StoredSignal>>;

    /// Prices of the most recent confirmed signals of one direction,
    /// newest first.
    async fn recent_confirmed_prices(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
        limit: i64,
    ) -> Result<Vec<f64>>;

    /// Price of the latest confirmed opposite pivot strictly before
    /// `before`, used as the SL anchor.
    async fn previous_confirmed_pivot(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
        before: DateTime<Utc>,
    ) -> Result<Option<f64>>;
}

/// Supply/demand zones, regenerated wholesale on every analysis.
#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn replace(&self, symbol: &str, timeframe: Timeframe, zones: &[NewZone]) -> Result<()>;

    /// Nearest zone edge on the profit side of `entry_price` usable as
    /// a TP target: SUPPLY bottom above for LONG, DEMAND top below for
    /// SHORT.
    async fn zone_tp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_long: bool,
        entry_price: f64,
    ) -> Result<Option<f64>>;
}

/// Append-only analysis-run metadata.
#[async_trait]
pub trait AnalysisRunRepository: Send + Sync {
    async fn append(&self, run: &AnalysisRunRecord) -> Result<()>;

    /// Latest run for the pair (trend + ATR used by the broker).
    async fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<AnalysisRunRecord>>;
}

/// Per-bar EMA/trend history.
#[async_trait]
pub trait IndicatorRepository: Send + Sync {
    async fn upsert(&self, symbol: &str, timeframe: Timeframe, rows: &[IndicatorRow]) -> Result<()>;
}

/// Watchlist pairs driving the pipeline.
#[async_trait]
pub trait WatchlistRepository: Send + Sync {
    /// Active (symbol, timeframe, exchange) triples.
    async fn active(&self) -> Result<Vec<(String, Timeframe, String)>>;

    async fn add(&self, symbol: &str, timeframe: Timeframe, exchange: &str) -> Result<()>;
}

/// Agent rows.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: &NewAgent) -> Result<Agent>;

    async fn get(&self, id: i64) -> Result<Option<Agent>>;

    async fn list_active(&self) -> Result<Vec<Agent>>;

    /// Distinct (symbol, timeframe) pairs of active agents.
    async fn active_pairs(&self) -> Result<Vec<(String, Timeframe)>>;

    /// Oldest active agent on a pair; its analysis parameters drive
    /// the pipeline's runs for that pair.
    async fn first_active_for_pair(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Agent>>;

    async fn set_balance(&self, id: i64, balance: f64) -> Result<()>;

    async fn set_active(&self, id: i64, is_active: bool) -> Result<()>;
}

/// Position lifecycle. The open and close paths are transactional so
/// the per-agent invariants hold under concurrent workers.
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Guarded insert: inside one IMMEDIATE transaction, re-checks
    /// `balance > 0` and that no OPEN position exists, inserts the row
    /// and zeroes the agent balance. Returns `None` when a guard
    /// fails (another worker won the race).
    async fn try_open(&self, position: &NewPosition) -> Result<Option<AgentPosition>>;

    async fn get(&self, id: i64) -> Result<Option<AgentPosition>>;

    async fn open_positions(&self, agent_id: i64) -> Result<Vec<AgentPosition>>;

    /// Persist mutable in-flight fields (stops, TP staging, partial
    /// state, best price, unrealized PnL).
    async fn save(&self, position: &AgentPosition) -> Result<()>;

    /// Transactional close: writes exit fields + status and restores
    /// the agent balance in the same transaction.
    async fn close(
        &self,
        position: &AgentPosition,
        reason: CloseReason,
        new_balance: f64,
    ) -> Result<()>;

    /// Number of positions of this agent carrying the given stable
    /// signal key; the duplicate check (never by signal id).
    async fn count_signal_key(
        &self,
        agent_id: i64,
        signal_time: DateTime<Utc>,
        is_bullish: bool,
    ) -> Result<i64>;
}

/// Append-only per-agent event log.
#[async_trait]
pub trait AgentLogRepository: Send + Sync {
    async fn append(&self, agent_id: i64, action: &str, details: serde_json::Value) -> Result<()>;
}
