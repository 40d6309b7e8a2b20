use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::warn;

use crate::domain::repositories::PositionRepository;
use crate::domain::trading::position::{AgentPosition, NewPosition, PositionStatus, Side};
use crate::domain::trading::CloseReason;

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_position(row: &sqlx::sqlite::SqliteRow) -> Result<AgentPosition> {
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let entry_signal_time: Option<i64> = row.try_get("entry_signal_time")?;
        let closed_at: Option<i64> = row.try_get("closed_at")?;

        Ok(AgentPosition {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            symbol: row.try_get("symbol")?,
            side: Side::from_str(&side)?,
            entry_price: row.try_get("entry_price")?,
            exit_price: row.try_get("exit_price")?,
            stop_loss: row.try_get("stop_loss")?,
            original_stop_loss: row.try_get("original_stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            tp2: row.try_get("tp2")?,
            quantity: row.try_get("quantity")?,
            original_quantity: row.try_get("original_quantity")?,
            invested_eur: row.try_get("invested_eur")?,
            status: PositionStatus::from_str(&status)?,
            partial_closed: row.try_get("partial_closed")?,
            partial_pnl: row.try_get("partial_pnl")?,
            best_price: row.try_get("best_price")?,
            entry_signal_time: entry_signal_time.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            entry_signal_is_bullish: row.try_get("entry_signal_is_bullish")?,
            exit_signal_id: row.try_get("exit_signal_id")?,
            pnl: row.try_get("pnl")?,
            pnl_percent: row.try_get("pnl_percent")?,
            unrealized_pnl: row.try_get("unrealized_pnl")?,
            unrealized_pnl_percent: row.try_get("unrealized_pnl_percent")?,
            current_price: row.try_get("current_price")?,
            opened_at: Utc.timestamp_opt(row.try_get("opened_at")?, 0).unwrap(),
            closed_at: closed_at.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        })
    }

    /// The open and close paths serialize against each other with a
    /// write transaction taken up front; SQLite allows a single writer,
    /// so BEGIN IMMEDIATE is the equivalent of the row lock a server
    /// database would take.
    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("Failed to begin immediate transaction")?;
        Ok(conn)
    }

    async fn finish(mut conn: PoolConnection<Sqlite>, commit: bool) -> Result<()> {
        let stmt = if commit { "COMMIT" } else { "ROLLBACK" };
        sqlx::query(stmt)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to {stmt} transaction"))?;
        Ok(())
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn try_open(&self, position: &NewPosition) -> Result<Option<AgentPosition>> {
        let mut conn = self.begin_immediate().await?;

        let body = async {
            // Guard 1: balance must still be engaged-able.
            let balance: Option<f64> = sqlx::query_scalar("SELECT balance FROM agents WHERE id = ?")
                .bind(position.agent_id)
                .fetch_optional(&mut *conn)
                .await?;
            let Some(balance) = balance else {
                warn!(agent_id = position.agent_id, "agent vanished before open");
                return Ok::<Option<AgentPosition>, anyhow::Error>(None);
            };
            if balance <= 0.0 {
                warn!(agent_id = position.agent_id, balance, "open race guard: balance already spent");
                return Ok(None);
            }

            // Guard 2: at most one OPEN position per agent.
            let open_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM agent_positions WHERE agent_id = ? AND status = 'OPEN'",
            )
            .bind(position.agent_id)
            .fetch_one(&mut *conn)
            .await?;
            if open_count > 0 {
                warn!(agent_id = position.agent_id, "open race guard: position already open");
                return Ok(None);
            }

            let now = Utc::now();
            let result = sqlx::query(
                r#"
                INSERT INTO agent_positions
                    (agent_id, symbol, side, entry_price, stop_loss, original_stop_loss,
                     take_profit, tp2, quantity, original_quantity, invested_eur, status,
                     partial_closed, best_price, entry_signal_time, entry_signal_is_bullish,
                     opened_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', 0, ?, ?, ?, ?)
                "#,
            )
            .bind(position.agent_id)
            .bind(&position.symbol)
            .bind(position.side.as_str())
            .bind(position.entry_price)
            .bind(position.stop_loss)
            .bind(position.stop_loss)
            .bind(position.take_profit)
            .bind(position.tp2)
            .bind(position.quantity)
            .bind(position.quantity)
            .bind(position.invested_eur)
            .bind(position.entry_price)
            .bind(position.entry_signal_time.timestamp())
            .bind(position.entry_signal_is_bullish)
            .bind(now.timestamp())
            .execute(&mut *conn)
            .await
            .context("Failed to insert position")?;
            let id = result.last_insert_rowid();

            sqlx::query("UPDATE agents SET balance = 0, updated_at = ? WHERE id = ?")
                .bind(now.timestamp())
                .bind(position.agent_id)
                .execute(&mut *conn)
                .await
                .context("Failed to engage agent balance")?;

            Ok(Some(AgentPosition {
                id,
                agent_id: position.agent_id,
                symbol: position.symbol.clone(),
                side: position.side,
                entry_price: position.entry_price,
                exit_price: None,
                stop_loss: position.stop_loss,
                original_stop_loss: position.stop_loss,
                take_profit: Some(position.take_profit),
                tp2: Some(position.tp2),
                quantity: position.quantity,
                original_quantity: position.quantity,
                invested_eur: position.invested_eur,
                status: PositionStatus::Open,
                partial_closed: false,
                partial_pnl: None,
                best_price: Some(position.entry_price),
                entry_signal_time: Some(position.entry_signal_time),
                entry_signal_is_bullish: Some(position.entry_signal_is_bullish),
                exit_signal_id: None,
                pnl: None,
                pnl_percent: None,
                unrealized_pnl: None,
                unrealized_pnl_percent: None,
                current_price: None,
                opened_at: Utc.timestamp_opt(now.timestamp(), 0).unwrap(),
                closed_at: None,
            }))
        }
        .await;

        match body {
            Ok(opened) => {
                Self::finish(conn, true).await?;
                Ok(opened)
            }
            Err(e) => {
                let _ = Self::finish(conn, false).await;
                Err(e)
            }
        }
    }

    async fn get(&self, id: i64) -> Result<Option<AgentPosition>> {
        let row = sqlx::query("SELECT * FROM agent_positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_position).transpose()
    }

    async fn open_positions(&self, agent_id: i64) -> Result<Vec<AgentPosition>> {
        let rows = sqlx::query(
            "SELECT * FROM agent_positions WHERE agent_id = ? AND status = 'OPEN' ORDER BY opened_at, id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load open positions")?;
        rows.iter().map(Self::map_position).collect()
    }

    async fn save(&self, position: &AgentPosition) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_positions SET
                stop_loss = ?,
                take_profit = ?,
                quantity = ?,
                partial_closed = ?,
                partial_pnl = ?,
                best_price = ?,
                unrealized_pnl = ?,
                unrealized_pnl_percent = ?,
                current_price = ?
            WHERE id = ?
            "#,
        )
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.quantity)
        .bind(position.partial_closed)
        .bind(position.partial_pnl)
        .bind(position.best_price)
        .bind(position.unrealized_pnl)
        .bind(position.unrealized_pnl_percent)
        .bind(position.current_price)
        .bind(position.id)
        .execute(&self.pool)
        .await
        .context("Failed to save position")?;
        Ok(())
    }

    async fn close(&self, position: &AgentPosition, _reason: CloseReason, new_balance: f64) -> Result<()> {
        let mut conn = self.begin_immediate().await?;

        let body = async {
            sqlx::query(
                r#"
                UPDATE agent_positions SET
                    status = ?,
                    exit_price = ?,
                    pnl = ?,
                    pnl_percent = ?,
                    exit_signal_id = ?,
                    quantity = ?,
                    partial_closed = ?,
                    partial_pnl = ?,
                    closed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(position.status.as_str())
            .bind(position.exit_price)
            .bind(position.pnl)
            .bind(position.pnl_percent)
            .bind(position.exit_signal_id)
            .bind(position.quantity)
            .bind(position.partial_closed)
            .bind(position.partial_pnl)
            .bind(position.closed_at.map(|t| t.timestamp()))
            .bind(position.id)
            .execute(&mut *conn)
            .await
            .context("Failed to close position")?;

            sqlx::query("UPDATE agents SET balance = ?, updated_at = ? WHERE id = ?")
                .bind(new_balance)
                .bind(Utc::now().timestamp())
                .bind(position.agent_id)
                .execute(&mut *conn)
                .await
                .context("Failed to restore agent balance")?;

            Ok::<(), anyhow::Error>(())
        }
        .await;

        match body {
            Ok(()) => Self::finish(conn, true).await,
            Err(e) => {
                let _ = Self::finish(conn, false).await;
                Err(e)
            }
        }
    }

    async fn count_signal_key(
        &self,
        agent_id: i64,
        signal_time: DateTime<Utc>,
        is_bullish: bool,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM agent_positions
            WHERE agent_id = ?
              AND entry_signal_time = ?
              AND entry_signal_is_bullish = ?
            "#,
        )
        .bind(agent_id)
        .bind(signal_time.timestamp())
        .bind(is_bullish)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
