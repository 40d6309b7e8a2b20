//! Runs the detection engine over stored bars and persists the result:
//! signals (upsert + prune, preserving `detected_at`), zones
//! (wholesale replace), per-bar indicators and the analysis-run row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::application::engine::DetectionEngine;
use crate::domain::analysis::{
    AnalysisConfig, AnalysisResult, AnalysisRunRecord, CalculationMethod, IndicatorRow, NewSignal, NewZone,
    SensitivityPreset, SignalMode,
};
use crate::domain::errors::AnalysisError;
use crate::domain::market::{candle_interval_secs, OhlcvBar, Timeframe};
use crate::domain::ports::DistributedStore;
use crate::domain::repositories::{
    AnalysisRunRepository, IndicatorRepository, OhlcvRepository, SignalRepository, ZoneRepository,
};
use crate::domain::trading::Agent;

/// Below this many bars an analysis returns empty instead of guessing
/// on noise.
pub const MIN_ANALYSIS_BARS: usize = 50;

/// KV key holding the timestamp of the last completed pipeline run.
pub const HEARTBEAT_KEY: &str = "pipeline_heartbeat";

/// On the first-ever analysis of a pair, signals older than this many
/// candles are backdated so agents never act on historical ghosts.
const GHOST_CUTOFF_CANDLES: i64 = 100;

/// After an outage, a new signal whose bar predates the last heartbeat
/// by more than this many candles accrued during downtime and is
/// backdated instead of stamped fresh.
const HEARTBEAT_TOLERANCE_CANDLES: i64 = 2;

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: i64,
    pub sensitivity: SensitivityPreset,
    pub signal_mode: SignalMode,
    pub confirmation_bars: usize,
    pub method: CalculationMethod,
    pub atr_length: usize,
    pub average_length: usize,
    pub absolute_reversal: f64,
    pub show_zones: bool,
}

impl AnalysisRequest {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            limit: 500,
            sensitivity: SensitivityPreset::Medium,
            signal_mode: SignalMode::ConfirmedOnly,
            confirmation_bars: 0,
            method: CalculationMethod::Average,
            atr_length: 5,
            average_length: 5,
            absolute_reversal: 0.5,
            show_zones: false,
        }
    }

    /// An agent's analysis parameters drive its pair's runs.
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            symbol: agent.symbol.clone(),
            timeframe: agent.timeframe,
            limit: agent.analysis_limit,
            sensitivity: agent.sensitivity,
            signal_mode: agent.signal_mode,
            confirmation_bars: agent.confirmation_bars as usize,
            method: agent.method,
            atr_length: agent.atr_length as usize,
            average_length: agent.average_length as usize,
            absolute_reversal: agent.absolute_reversal,
            show_zones: true,
        }
    }

    fn to_engine_config(&self) -> AnalysisConfig {
        let mut config = AnalysisConfig {
            signal_mode: self.signal_mode,
            sensitivity: self.sensitivity,
            method: self.method,
            atr_length: self.atr_length,
            average_length: self.average_length,
            confirmation_bars: self.confirmation_bars,
            absolute_reversal: self.absolute_reversal,
            timeframe: self.timeframe,
            ..AnalysisConfig::default()
        };
        config.zones.generate = self.show_zones;
        config
    }
}

pub struct AnalysisService {
    ohlcv: Arc<dyn OhlcvRepository>,
    signals: Arc<dyn SignalRepository>,
    zones: Arc<dyn ZoneRepository>,
    runs: Arc<dyn AnalysisRunRepository>,
    indicators: Arc<dyn IndicatorRepository>,
    kv: Arc<dyn DistributedStore>,
}

impl AnalysisService {
    pub fn new(
        ohlcv: Arc<dyn OhlcvRepository>,
        signals: Arc<dyn SignalRepository>,
        zones: Arc<dyn ZoneRepository>,
        runs: Arc<dyn AnalysisRunRepository>,
        indicators: Arc<dyn IndicatorRepository>,
        kv: Arc<dyn DistributedStore>,
    ) -> Self {
        Self {
            ohlcv,
            signals,
            zones,
            runs,
            indicators,
            kv,
        }
    }

    /// Full pipeline: load bars → run the engine → persist. Returns the
    /// engine result; an under-populated pair yields an empty result
    /// and persists nothing.
    pub async fn run_analysis(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        if request.confirmation_bars > 5 {
            return Err(AnalysisError::InvalidParameter {
                reason: format!("confirmation_bars must be 0-5, got {}", request.confirmation_bars),
            }
            .into());
        }

        let bars = self
            .ohlcv
            .recent_bars(&request.symbol, request.timeframe, request.limit)
            .await?;

        if bars.len() < MIN_ANALYSIS_BARS {
            debug!(
                symbol = %request.symbol,
                timeframe = %request.timeframe,
                bars = bars.len(),
                "not enough bars for analysis, returning empty result"
            );
            return Ok(AnalysisResult::default());
        }

        let engine = DetectionEngine::new(request.to_engine_config());
        let result = engine.execute(&bars);

        self.persist_signals(request, &bars, &result).await?;
        self.persist_zones(request, &bars, &result).await?;
        self.persist_indicators(request, &bars, &result).await?;
        self.persist_run(request, &bars, &result).await?;

        info!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            signals = result.signals.len(),
            zones = result.zones.len(),
            bars = bars.len(),
            trend = result.current_trend.map(|t| t.state.as_str()).unwrap_or("n/a"),
            "analysis complete"
        );
        Ok(result)
    }

    /// Timestamp of the last completed pipeline run, when one exists.
    async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        let raw = self.kv.get(HEARTBEAT_KEY).await.ok()??;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Upsert the new signal set and prune rows the engine no longer
    /// produces. Upsert-then-prune (instead of delete + insert) keeps
    /// readers from ever observing an empty signal table for the pair.
    async fn persist_signals(
        &self,
        request: &AnalysisRequest,
        bars: &[OhlcvBar],
        result: &AnalysisResult,
    ) -> Result<()> {
        let now = Utc::now();
        let candle_seconds = candle_interval_secs(bars);
        let last_bar_time = bars[bars.len() - 1].time;
        let recent_cutoff = last_bar_time - Duration::seconds(candle_seconds * GHOST_CUTOFF_CANDLES);

        let existing = self.signals.list(&request.symbol, request.timeframe).await?;
        let first_analysis = existing.is_empty();
        let mut existing_detected: HashMap<(DateTime<Utc>, bool), Option<DateTime<Utc>>> = HashMap::new();
        let mut existing_ids: HashMap<(DateTime<Utc>, bool), i64> = HashMap::new();
        for row in &existing {
            let key = (row.time, row.is_bullish);
            existing_detected.insert(key, row.detected_at);
            existing_ids.insert(key, row.id);
        }

        let heartbeat = self.last_heartbeat().await;
        let downtime_cutoff =
            heartbeat.map(|hb| hb - Duration::seconds(candle_seconds * HEARTBEAT_TOLERANCE_CANDLES));

        let mut kept_keys: HashSet<(DateTime<Utc>, bool)> = HashSet::new();
        let mut upserts: Vec<NewSignal> = Vec::new();

        for sig in &result.signals {
            if sig.bar_index >= bars.len() {
                continue;
            }
            let sig_time = bars[sig.bar_index].time;
            let key = (sig_time, sig.is_bullish);
            kept_keys.insert(key);

            let detected_at = match existing_detected.get(&key).copied().flatten() {
                Some(original) => original,
                None => {
                    if first_analysis {
                        if sig_time >= recent_cutoff {
                            now
                        } else {
                            // Historical ghost: never actionable.
                            debug!(
                                symbol = %request.symbol,
                                time = %sig_time,
                                bullish = sig.is_bullish,
                                "ghost signal on first analysis, backdating"
                            );
                            sig_time
                        }
                    } else if downtime_cutoff.is_some_and(|cutoff| sig_time < cutoff) {
                        // The bar predates the last heartbeat: the
                        // signal accrued while no worker was running.
                        // Backdating prevents a re-open stampede after
                        // recovery.
                        debug!(
                            symbol = %request.symbol,
                            time = %sig_time,
                            bullish = sig.is_bullish,
                            "signal accrued during downtime, backdating"
                        );
                        sig_time
                    } else {
                        info!(
                            symbol = %request.symbol,
                            timeframe = %request.timeframe,
                            time = %sig_time,
                            bullish = sig.is_bullish,
                            price = sig.price,
                            "new signal detected"
                        );
                        now
                    }
                }
            };

            upserts.push(NewSignal {
                time: sig_time,
                bar_index: sig.bar_index as i64,
                price: sig.price,
                actual_price: sig.actual_price,
                is_bullish: sig.is_bullish,
                is_preview: sig.is_preview,
                label: sig.label().to_string(),
                detected_at,
            });
        }

        // In "Confirmed + Preview" mode the same candle can carry both
        // renditions of one signal; the confirmed one wins the key.
        let mut deduped: HashMap<(DateTime<Utc>, bool), NewSignal> = HashMap::new();
        for sig in upserts {
            let key = (sig.time, sig.is_bullish);
            match deduped.get(&key) {
                None => {
                    deduped.insert(key, sig);
                }
                Some(current) if current.is_preview && !sig.is_preview => {
                    deduped.insert(key, sig);
                }
                Some(_) => {}
            }
        }
        let mut final_signals: Vec<NewSignal> = deduped.into_values().collect();
        final_signals.sort_by_key(|s| (s.time, s.is_bullish));

        if !final_signals.is_empty() {
            self.signals
                .upsert(&request.symbol, request.timeframe, &final_signals)
                .await?;
        }

        if result.signals.is_empty() {
            // Nothing survived the run: clear the pair.
            self.signals.delete_pair(&request.symbol, request.timeframe).await?;
        } else {
            let stale_ids: Vec<i64> = existing_ids
                .iter()
                .filter(|(key, _)| !kept_keys.contains(*key))
                .map(|(_, id)| *id)
                .collect();
            if !stale_ids.is_empty() {
                self.signals.delete_ids(&stale_ids).await?;
            }
        }

        Ok(())
    }

    async fn persist_zones(
        &self,
        request: &AnalysisRequest,
        bars: &[OhlcvBar],
        result: &AnalysisResult,
    ) -> Result<()> {
        if result.zones.is_empty() {
            return Ok(());
        }

        let zones: Vec<NewZone> = result
            .zones
            .iter()
            .map(|z| NewZone {
                time: bars[z.start_bar.min(bars.len() - 1)].time,
                zone_type: z.zone_type,
                center_price: z.center_price,
                top_price: z.top_price,
                bottom_price: z.bottom_price,
                start_bar: z.start_bar as i64,
                end_bar: z.end_bar as i64,
            })
            .collect();

        self.zones.replace(&request.symbol, request.timeframe, &zones).await
    }

    async fn persist_indicators(
        &self,
        request: &AnalysisRequest,
        bars: &[OhlcvBar],
        result: &AnalysisResult,
    ) -> Result<()> {
        if result.trend_history.is_empty() {
            return Ok(());
        }

        let rows: Vec<IndicatorRow> = result
            .trend_history
            .iter()
            .zip(bars.iter())
            .map(|(trend, bar)| IndicatorRow {
                time: bar.time,
                ema_9: (trend.ema_fast != 0.0).then_some(trend.ema_fast),
                ema_14: (trend.ema_mid != 0.0).then_some(trend.ema_mid),
                ema_21: (trend.ema_slow != 0.0).then_some(trend.ema_slow),
                trend: trend.state,
            })
            .collect();

        self.indicators
            .upsert(&request.symbol, request.timeframe, &rows)
            .await
    }

    async fn persist_run(
        &self,
        request: &AnalysisRequest,
        bars: &[OhlcvBar],
        result: &AnalysisResult,
    ) -> Result<()> {
        self.runs
            .append(&AnalysisRunRecord {
                symbol: request.symbol.clone(),
                timeframe: request.timeframe,
                sensitivity: request.sensitivity,
                signal_mode: request.signal_mode,
                atr_multiplier: result.atr_multiplier,
                current_atr: result.current_atr,
                threshold: result.current_threshold,
                current_trend: result.current_trend.map(|t| t.state),
                total_signals: result.signals.len() as i64,
                total_zones: result.zones.len() as i64,
                bars_analyzed: bars.len() as i64,
            })
            .await
    }
}
