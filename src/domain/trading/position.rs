use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn is_bullish(&self) -> bool {
        matches!(self, Side::Long)
    }

    pub fn from_signal(is_bullish: bool) -> Side {
        if is_bullish {
            Side::Long
        } else {
            Side::Short
        }
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LONG" => Ok(Side::Long),
            "SHORT" => Ok(Side::Short),
            _ => Err(anyhow!("Invalid side: '{}'", s)),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Stopped,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Stopped => "STOPPED",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "STOPPED" => Ok(PositionStatus::Stopped),
            _ => Err(anyhow!("Invalid position status: '{}'", s)),
        }
    }
}

/// Why a position (or half of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    TakeProfit2,
    BullishReversal,
    BearishReversal,
    ManualClose,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TrailingStop => "TRAILING_STOP",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::TakeProfit2 => "TAKE_PROFIT_2",
            CloseReason::BullishReversal => "BULLISH_REVERSAL",
            CloseReason::BearishReversal => "BEARISH_REVERSAL",
            CloseReason::ManualClose => "MANUAL_CLOSE",
        }
    }

    /// Stop exits mark the position STOPPED; everything else CLOSED.
    pub fn final_status(&self) -> PositionStatus {
        match self {
            CloseReason::StopLoss | CloseReason::TrailingStop => PositionStatus::Stopped,
            _ => PositionStatus::Closed,
        }
    }
}

/// A position held by one agent.
///
/// The entry signal is referenced by its stable key
/// `(entry_signal_time, entry_signal_is_bullish)` rather than a signal
/// id: re-analysis rewrites signal ids but never the key.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPosition {
    pub id: i64,
    pub agent_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub stop_loss: f64,
    /// Initial SL, immutable after open; used to tell trailing exits
    /// from plain stop-outs and to size the breakeven trigger.
    pub original_stop_loss: f64,
    /// Currently active TP target (TP1, then TP2 after partial close).
    pub take_profit: Option<f64>,
    pub tp2: Option<f64>,
    pub quantity: f64,
    pub original_quantity: f64,
    /// EUR engaged at open; the basis for balance restoration.
    pub invested_eur: f64,
    pub status: PositionStatus,
    pub partial_closed: bool,
    pub partial_pnl: Option<f64>,
    /// High-water mark for LONG, low-water for SHORT.
    pub best_price: Option<f64>,
    pub entry_signal_time: Option<DateTime<Utc>>,
    pub entry_signal_is_bullish: Option<bool>,
    pub exit_signal_id: Option<i64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_percent: Option<f64>,
    pub current_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Values the position manager supplies when opening.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub agent_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub tp2: f64,
    pub quantity: f64,
    pub invested_eur: f64,
    pub entry_signal_time: DateTime<Utc>,
    pub entry_signal_is_bullish: bool,
}
