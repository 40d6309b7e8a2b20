use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::analysis::{CalculationMethod, SensitivityPreset, SignalMode};
use crate::domain::market::Timeframe;

/// Paper agents simulate fills locally; live agents route to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMode {
    Paper,
    Live,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Paper => "paper",
            AgentMode::Live => "live",
        }
    }
}

impl FromStr for AgentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(AgentMode::Paper),
            "live" => Ok(AgentMode::Live),
            _ => Err(anyhow!("Invalid agent mode: '{}'. Must be 'paper' or 'live'", s)),
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A trading agent bound to one (symbol, timeframe) pair.
///
/// `balance` is the currently available cash in EUR: it drops to zero
/// while a position is open and is restored (plus realized PnL) on
/// close. `trade_amount` is the configured stake used to seed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trade_amount: f64,
    pub balance: f64,
    pub is_active: bool,
    pub mode: AgentMode,
    // Analysis parameters
    pub sensitivity: SensitivityPreset,
    pub signal_mode: SignalMode,
    pub analysis_limit: i64,
    pub confirmation_bars: i64,
    pub method: CalculationMethod,
    pub atr_length: i64,
    pub average_length: i64,
    pub absolute_reversal: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create an agent row; everything else defaults.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trade_amount: f64,
    pub mode: AgentMode,
    pub sensitivity: SensitivityPreset,
    pub signal_mode: SignalMode,
}

impl NewAgent {
    pub fn new(name: &str, symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            trade_amount: 100.0,
            mode: AgentMode::Paper,
            sensitivity: SensitivityPreset::Medium,
            signal_mode: SignalMode::ConfirmedOnly,
        }
    }
}
