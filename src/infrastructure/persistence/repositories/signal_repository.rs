use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::analysis::{NewSignal, StoredSignal};
use crate::domain::market::Timeframe;
use crate::domain::repositories::SignalRepository;

pub struct SqliteSignalRepository {
    pool: SqlitePool,
}

impl SqliteSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_signal(row: &sqlx::sqlite::SqliteRow) -> Result<StoredSignal> {
        let timeframe: String = row.try_get("timeframe")?;
        let detected_at: Option<i64> = row.try_get("detected_at")?;
        Ok(StoredSignal {
            id: row.try_get("id")?,
            time: Utc.timestamp_opt(row.try_get("time")?, 0).unwrap(),
            symbol: row.try_get("symbol")?,
            timeframe: Timeframe::from_str(&timeframe)?,
            bar_index: row.try_get("bar_index")?,
            price: row.try_get("price")?,
            actual_price: row.try_get("actual_price")?,
            is_bullish: row.try_get("is_bullish")?,
            is_preview: row.try_get("is_preview")?,
            label: row.try_get("signal_label")?,
            detected_at: detected_at.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        })
    }
}

#[async_trait]
impl SignalRepository for SqliteSignalRepository {
    async fn list(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<StoredSignal>> {
        let rows = sqlx::query("SELECT * FROM signals WHERE symbol = ? AND timeframe = ?")
            .bind(symbol)
            .bind(timeframe.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list signals")?;
        rows.iter().map(Self::map_signal).collect()
    }

    async fn upsert(&self, symbol: &str, timeframe: Timeframe, signals: &[NewSignal]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp();

        for sig in signals {
            sqlx::query(
                r#"
                INSERT INTO signals
                    (time, symbol, timeframe, bar_index, price, actual_price,
                     is_bullish, is_preview, signal_label, detected_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (time, symbol, timeframe, is_bullish) DO UPDATE SET
                    bar_index = excluded.bar_index,
                    price = excluded.price,
                    actual_price = excluded.actual_price,
                    is_preview = excluded.is_preview,
                    signal_label = excluded.signal_label,
                    detected_at = COALESCE(signals.detected_at, excluded.detected_at)
                "#,
            )
            .bind(sig.time.timestamp())
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(sig.bar_index)
            .bind(sig.price)
            .bind(sig.actual_price)
            .bind(sig.is_bullish)
            .bind(sig.is_preview)
            .bind(&sig.label)
            .bind(sig.detected_at.timestamp())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert signal")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_ids(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM signals WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete stale signal")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_pair(&self, symbol: &str, timeframe: Timeframe) -> Result<()> {
        sqlx::query("DELETE FROM signals WHERE symbol = ? AND timeframe = ?")
            .bind(symbol)
            .bind(timeframe.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete signals for pair")?;
        Ok(())
    }

    async fn latest_confirmed(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<StoredSignal>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM signals
            WHERE symbol = ? AND timeframe = ? AND is_preview = 0
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_signal).transpose()
    }

    async fn latest_confirmed_for(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
    ) -> Result<Option<StoredSignal>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM signals
            WHERE symbol = ? AND timeframe = ? AND is_preview = 0 AND is_bullish = ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(is_bullish)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_signal).transpose()
    }

    async fn recent_confirmed_prices(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
        limit: i64,
    ) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            r#"
            SELECT price FROM signals
            WHERE symbol = ? AND timeframe = ? AND is_preview = 0 AND is_bullish = ?
            ORDER BY time DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(is_bullish)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Ok(r.try_get("price")?)).collect()
    }

    async fn previous_confirmed_pivot(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_bullish: bool,
        before: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT price FROM signals
            WHERE symbol = ? AND timeframe = ?
              AND is_bullish = ? AND is_preview = 0
              AND time < ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(is_bullish)
        .bind(before.timestamp())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get("price")).transpose()?)
    }
}
