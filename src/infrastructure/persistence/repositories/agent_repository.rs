use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::analysis::{CalculationMethod, SensitivityPreset, SignalMode};
use crate::domain::market::Timeframe;
use crate::domain::repositories::AgentRepository;
use crate::domain::trading::{Agent, AgentMode, NewAgent};

pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_agent(row: &sqlx::sqlite::SqliteRow) -> Result<Agent> {
        let timeframe: String = row.try_get("timeframe")?;
        let mode: String = row.try_get("mode")?;
        let sensitivity: String = row.try_get("sensitivity")?;
        let signal_mode: String = row.try_get("signal_mode")?;
        let method: String = row.try_get("method")?;

        Ok(Agent {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            symbol: row.try_get("symbol")?,
            timeframe: Timeframe::from_str(&timeframe)?,
            trade_amount: row.try_get("trade_amount")?,
            balance: row.try_get("balance")?,
            is_active: row.try_get("is_active")?,
            mode: AgentMode::from_str(&mode)?,
            sensitivity: SensitivityPreset::from_str(&sensitivity)?,
            signal_mode: SignalMode::from_str(&signal_mode)?,
            analysis_limit: row.try_get("analysis_limit")?,
            confirmation_bars: row.try_get("confirmation_bars")?,
            method: CalculationMethod::from_str(&method)?,
            atr_length: row.try_get("atr_length")?,
            average_length: row.try_get("average_length")?,
            absolute_reversal: row.try_get("absolute_reversal")?,
            created_at: Utc.timestamp_opt(row.try_get("created_at")?, 0).unwrap(),
            updated_at: Utc.timestamp_opt(row.try_get("updated_at")?, 0).unwrap(),
        })
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn create(&self, agent: &NewAgent) -> Result<Agent> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO agents
                (name, symbol, timeframe, trade_amount, balance, is_active, mode,
                 sensitivity, signal_mode, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.symbol)
        .bind(agent.timeframe.as_str())
        .bind(agent.trade_amount)
        .bind(agent.trade_amount)
        .bind(agent.mode.as_str())
        .bind(agent.sensitivity.as_str())
        .bind(agent.signal_mode.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create agent")?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .context("Agent vanished immediately after insert")
    }

    async fn get(&self, id: i64) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_agent).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list active agents")?;
        rows.iter().map(Self::map_agent).collect()
    }

    async fn active_pairs(&self) -> Result<Vec<(String, Timeframe)>> {
        let rows = sqlx::query("SELECT DISTINCT symbol, timeframe FROM agents WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let timeframe: String = row.try_get("timeframe")?;
                Ok((row.try_get("symbol")?, Timeframe::from_str(&timeframe)?))
            })
            .collect()
    }

    async fn first_active_for_pair(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Agent>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM agents
            WHERE symbol = ? AND timeframe = ? AND is_active = 1
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_agent).transpose()
    }

    async fn set_balance(&self, id: i64, balance: f64) -> Result<()> {
        sqlx::query("UPDATE agents SET balance = ?, updated_at = ? WHERE id = ?")
            .bind(balance)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update agent balance")?;
        Ok(())
    }

    async fn set_active(&self, id: i64, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE agents SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update agent active flag")?;
        Ok(())
    }
}
