//! Entities and configuration of the reversal detection engine.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::market::Timeframe;

/// Which kind of signals the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMode {
    ConfirmedOnly,
    ConfirmedPlusPreview,
    PreviewOnly,
}

impl SignalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalMode::ConfirmedOnly => "Confirmed Only",
            SignalMode::ConfirmedPlusPreview => "Confirmed + Preview",
            SignalMode::PreviewOnly => "Preview Only",
        }
    }
}

impl FromStr for SignalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Confirmed Only" => Ok(SignalMode::ConfirmedOnly),
            "Confirmed + Preview" => Ok(SignalMode::ConfirmedPlusPreview),
            "Preview Only" => Ok(SignalMode::PreviewOnly),
            _ => Err(anyhow!("Invalid signal mode: '{}'", s)),
        }
    }
}

impl fmt::Display for SignalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// ATR-based sensitivity preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensitivityPreset {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
    Custom,
}

impl SensitivityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityPreset::VeryHigh => "Very High",
            SensitivityPreset::High => "High",
            SensitivityPreset::Medium => "Medium",
            SensitivityPreset::Low => "Low",
            SensitivityPreset::VeryLow => "Very Low",
            SensitivityPreset::Custom => "Custom",
        }
    }
}

impl FromStr for SensitivityPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Very High" => Ok(SensitivityPreset::VeryHigh),
            "High" => Ok(SensitivityPreset::High),
            "Medium" => Ok(SensitivityPreset::Medium),
            "Low" => Ok(SensitivityPreset::Low),
            "Very Low" => Ok(SensitivityPreset::VeryLow),
            "Custom" => Ok(SensitivityPreset::Custom),
            _ => Err(anyhow!("Invalid sensitivity preset: '{}'", s)),
        }
    }
}

impl fmt::Display for SensitivityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Price source used by the zigzag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationMethod {
    /// EMA-smoothed highs/lows.
    Average,
    /// Raw highs/lows.
    HighLow,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::Average => "average",
            CalculationMethod::HighLow => "high_low",
        }
    }
}

impl FromStr for CalculationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "average" => Ok(CalculationMethod::Average),
            "high_low" => Ok(CalculationMethod::HighLow),
            _ => Err(anyhow!("Invalid calculation method: '{}'", s)),
        }
    }
}

/// Triple-EMA trend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendState {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendState::Bullish => "BULLISH",
            TrendState::Bearish => "BEARISH",
            TrendState::Neutral => "NEUTRAL",
        }
    }

    pub fn parse(s: &str) -> TrendState {
        match s {
            "BULLISH" => TrendState::Bullish,
            "BEARISH" => TrendState::Bearish,
            _ => TrendState::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    Supply,
    Demand,
}

impl ZoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Supply => "SUPPLY",
            ZoneType::Demand => "DEMAND",
        }
    }
}

/// A confirmed or preview swing point found by the zigzag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pivot {
    /// Possibly EMA-smoothed extreme.
    pub price: f64,
    /// Raw high/low at the pivot bar.
    pub actual_price: f64,
    pub bar_index: usize,
    pub is_high: bool,
    pub is_preview: bool,
}

/// A reversal signal produced by the U1/D1 detector or the preview pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReversalSignal {
    pub bar_index: usize,
    pub price: f64,
    pub actual_price: f64,
    pub is_bullish: bool,
    pub is_preview: bool,
}

impl ReversalSignal {
    pub fn label(&self) -> &'static str {
        if self.is_preview {
            "PREVIEW"
        } else {
            "REVERSAL"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupplyDemandZone {
    pub zone_type: ZoneType,
    pub center_price: f64,
    pub top_price: f64,
    pub bottom_price: f64,
    pub start_bar: usize,
    pub end_bar: usize,
}

/// Per-bar trend snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendInfo {
    pub state: TrendState,
    pub ema_fast: f64,
    pub ema_mid: f64,
    pub ema_slow: f64,
    pub buy_signal: bool,
    pub sell_signal: bool,
    pub trend_changed_to_bullish: bool,
    pub trend_changed_to_bearish: bool,
}

/// Complete output of one engine run over a bar window.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub signals: Vec<ReversalSignal>,
    pub pivots: Vec<Pivot>,
    pub zones: Vec<SupplyDemandZone>,
    pub trend_history: Vec<TrendInfo>,
    pub current_trend: Option<TrendInfo>,
    pub current_atr: f64,
    pub current_threshold: f64,
    pub atr_multiplier: f64,
}

/// Resolved sensitivity: the two ingredients of the base reversal
/// threshold. `percent_threshold` is in percent of price (1.0 = 1%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityConfig {
    pub atr_multiplier: f64,
    pub percent_threshold: f64,
}

impl SensitivityConfig {
    /// Resolve a preset, scaling the ATR multiplier by timeframe:
    /// intraday fast timeframes need a tighter threshold, slow ones a
    /// wider one. `Custom` resolves to `Medium` here; callers supply
    /// their own config for true custom runs.
    pub fn from_preset(preset: SensitivityPreset, timeframe: Timeframe) -> Self {
        let (atr_mult, pct) = match preset {
            SensitivityPreset::VeryHigh => (1.0, 0.50),
            SensitivityPreset::High => (1.5, 0.75),
            SensitivityPreset::Medium | SensitivityPreset::Custom => (2.0, 1.00),
            SensitivityPreset::Low => (2.5, 1.50),
            SensitivityPreset::VeryLow => (3.0, 2.00),
        };
        let scale = match timeframe.minutes() {
            m if m <= 5 => 0.8,
            m if m <= 60 => 1.0,
            _ => 1.2,
        };
        SensitivityConfig {
            atr_multiplier: atr_mult * scale,
            percent_threshold: pct,
        }
    }

    pub fn from_custom(atr_multiplier: f64, percent_threshold: f64) -> Self {
        SensitivityConfig {
            atr_multiplier,
            percent_threshold,
        }
    }
}

// ── Reduction-module settings ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixProfileSettings {
    pub enabled: bool,
    /// Subsequence length m; `None` resolves from the timeframe.
    pub subsequence_length: Option<usize>,
    pub z_threshold: f64,
    pub rolling_window: usize,
    pub min_reduction: f64,
    pub decay_bars: usize,
}

impl Default for MatrixProfileSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subsequence_length: None,
            z_threshold: 1.8,
            rolling_window: 20,
            min_reduction: 0.40,
            decay_bars: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAdaptiveSettings {
    pub enabled: bool,
    pub lookback: usize,
    pub min_reduction: f64,
    pub spike_mult: f64,
    pub headroom: f64,
}

impl Default for VolumeAdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback: 20,
            min_reduction: 0.50,
            spike_mult: 1.5,
            headroom: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandlePatternSettings {
    pub enabled: bool,
    pub body_ratio_threshold: f64,
    pub engulfing_reduction: f64,
    pub hammer_reduction: f64,
    pub doji_reduction: f64,
}

impl Default for CandlePatternSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            body_ratio_threshold: 0.30,
            engulfing_reduction: 0.50,
            hammer_reduction: 0.65,
            doji_reduction: 0.80,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CusumSettings {
    pub enabled: bool,
    /// Drift allowance as a fraction of ATR.
    pub drift_fraction: f64,
    /// ATR multiples the cumulative sum must exceed to fire.
    pub threshold_mult: f64,
    pub min_reduction: f64,
    pub decay_bars: usize,
}

impl Default for CusumSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            drift_fraction: 0.5,
            threshold_mult: 3.0,
            min_reduction: 0.45,
            decay_bars: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSettings {
    pub generate: bool,
    /// Zone thickness in percent of the pivot price.
    pub thickness_pct: f64,
    pub extension_bars: usize,
    pub max_zones: usize,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            generate: false,
            thickness_pct: 0.02,
            extension_bars: 20,
            max_zones: 3,
        }
    }
}

/// Full configuration of one engine run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub signal_mode: SignalMode,
    pub sensitivity: SensitivityPreset,
    /// Used only when `sensitivity == Custom`.
    pub custom_sensitivity: Option<SensitivityConfig>,
    pub method: CalculationMethod,
    pub atr_length: usize,
    pub average_length: usize,
    /// Extra bars (0–5) a pivot must survive before confirmation.
    pub confirmation_bars: usize,
    pub absolute_reversal: f64,
    pub timeframe: Timeframe,
    pub ema_fast: usize,
    pub ema_mid: usize,
    pub ema_slow: usize,
    pub zones: ZoneSettings,
    pub matrix_profile: MatrixProfileSettings,
    pub volume_adaptive: VolumeAdaptiveSettings,
    pub candle_pattern: CandlePatternSettings,
    pub cusum: CusumSettings,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            signal_mode: SignalMode::ConfirmedOnly,
            sensitivity: SensitivityPreset::Medium,
            custom_sensitivity: None,
            method: CalculationMethod::Average,
            atr_length: 5,
            average_length: 5,
            confirmation_bars: 0,
            absolute_reversal: 0.5,
            timeframe: Timeframe::OneHour,
            ema_fast: 9,
            ema_mid: 14,
            ema_slow: 21,
            zones: ZoneSettings::default(),
            matrix_profile: MatrixProfileSettings::default(),
            volume_adaptive: VolumeAdaptiveSettings::default(),
            candle_pattern: CandlePatternSettings::default(),
            cusum: CusumSettings::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn resolved_sensitivity(&self) -> SensitivityConfig {
        if self.sensitivity == SensitivityPreset::Custom {
            self.custom_sensitivity
                .unwrap_or_else(|| SensitivityConfig::from_preset(SensitivityPreset::Medium, self.timeframe))
        } else {
            SensitivityConfig::from_preset(self.sensitivity, self.timeframe)
        }
    }
}

// ── Persisted rows ──────────────────────────────────────────────────

/// A signal row as stored in the signals table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSignal {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_index: i64,
    pub price: f64,
    pub actual_price: f64,
    pub is_bullish: bool,
    pub is_preview: bool,
    pub label: String,
    pub detected_at: Option<DateTime<Utc>>,
}

/// Signal values for an upsert, keyed by (time, symbol, timeframe,
/// is_bullish) with COALESCE-preserved detected_at.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub time: DateTime<Utc>,
    pub bar_index: i64,
    pub price: f64,
    pub actual_price: f64,
    pub is_bullish: bool,
    pub is_preview: bool,
    pub label: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewZone {
    pub time: DateTime<Utc>,
    pub zone_type: ZoneType,
    pub center_price: f64,
    pub top_price: f64,
    pub bottom_price: f64,
    pub start_bar: i64,
    pub end_bar: i64,
}

/// One row of the append-only analysis_runs table.
#[derive(Debug, Clone)]
pub struct AnalysisRunRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub sensitivity: SensitivityPreset,
    pub signal_mode: SignalMode,
    pub atr_multiplier: f64,
    pub current_atr: f64,
    pub threshold: f64,
    pub current_trend: Option<TrendState>,
    pub total_signals: i64,
    pub total_zones: i64,
    pub bars_analyzed: i64,
}

/// Per-bar indicator snapshot persisted alongside the signals.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub time: DateTime<Utc>,
    pub ema_9: Option<f64>,
    pub ema_14: Option<f64>,
    pub ema_21: Option<f64>,
    pub trend: TrendState,
}
