use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::analysis::{AnalysisRunRecord, SensitivityPreset, SignalMode, TrendState};
use crate::domain::market::Timeframe;
use crate::domain::repositories::AnalysisRunRepository;

pub struct SqliteAnalysisRunRepository {
    pool: SqlitePool,
}

impl SqliteAnalysisRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisRunRepository for SqliteAnalysisRunRepository {
    async fn append(&self, run: &AnalysisRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_runs
                (symbol, timeframe, sensitivity, signal_mode, atr_multiplier,
                 current_atr, threshold, current_trend, total_signals,
                 total_zones, bars_analyzed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.symbol)
        .bind(run.timeframe.as_str())
        .bind(run.sensitivity.as_str())
        .bind(run.signal_mode.as_str())
        .bind(run.atr_multiplier)
        .bind(run.current_atr)
        .bind(run.threshold)
        .bind(run.current_trend.map(|t| t.as_str()))
        .bind(run.total_signals)
        .bind(run.total_zones)
        .bind(run.bars_analyzed)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to append analysis run")?;

        Ok(())
    }

    async fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<AnalysisRunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM analysis_runs
            WHERE symbol = ? AND timeframe = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let sensitivity: String = row.try_get("sensitivity")?;
        let signal_mode: String = row.try_get("signal_mode")?;
        let trend: Option<String> = row.try_get("current_trend")?;

        Ok(Some(AnalysisRunRecord {
            symbol: row.try_get("symbol")?,
            timeframe,
            sensitivity: SensitivityPreset::from_str(&sensitivity)?,
            signal_mode: SignalMode::from_str(&signal_mode)?,
            atr_multiplier: row.try_get::<Option<f64>, _>("atr_multiplier")?.unwrap_or(0.0),
            current_atr: row.try_get::<Option<f64>, _>("current_atr")?.unwrap_or(0.0),
            threshold: row.try_get::<Option<f64>, _>("threshold")?.unwrap_or(0.0),
            current_trend: trend.map(|t| TrendState::parse(&t)),
            total_signals: row.try_get("total_signals")?,
            total_zones: row.try_get("total_zones")?,
            bars_analyzed: row.try_get("bars_analyzed")?,
        }))
    }
}
