use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::market::{OhlcvBar, Timeframe};
use crate::domain::repositories::OhlcvRepository;

pub struct SqliteOhlcvRepository {
    pool: SqlitePool,
}

impl SqliteOhlcvRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_bar(row: &sqlx::sqlite::SqliteRow) -> Result<OhlcvBar> {
        Ok(OhlcvBar {
            time: Utc.timestamp_opt(row.try_get("time")?, 0).unwrap(),
            open: row.try_get("open")?,
            high: row.try_get("high")?,
            low: row.try_get("low")?,
            close: row.try_get("close")?,
            volume: row.try_get("volume")?,
        })
    }
}

#[async_trait]
impl OhlcvRepository for SqliteOhlcvRepository {
    async fn upsert_bars(&self, symbol: &str, timeframe: Timeframe, bars: &[OhlcvBar]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO ohlcv (time, symbol, timeframe, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (time, symbol, timeframe) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )
            .bind(bar.time.timestamp())
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert OHLCV bar")?;
        }

        tx.commit().await?;
        Ok(bars.len())
    }

    async fn recent_bars(&self, symbol: &str, timeframe: Timeframe, limit: i64) -> Result<Vec<OhlcvBar>> {
        let rows = sqlx::query(
            r#"
            SELECT time, open, high, low, close, volume
            FROM (
                SELECT time, open, high, low, close, volume
                FROM ohlcv
                WHERE symbol = ? AND timeframe = ?
                ORDER BY time DESC
                LIMIT ?
            ) AS recent_bars
            ORDER BY time ASC
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load recent bars")?;

        rows.iter().map(Self::map_bar).collect()
    }

    async fn latest_bar(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<OhlcvBar>> {
        let row = sqlx::query(
            r#"
            SELECT time, open, high, low, close, volume
            FROM ohlcv
            WHERE symbol = ? AND timeframe = ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_bar).transpose()
    }
}
