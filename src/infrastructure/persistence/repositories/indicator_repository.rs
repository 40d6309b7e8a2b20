use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::analysis::IndicatorRow;
use crate::domain::market::Timeframe;
use crate::domain::repositories::IndicatorRepository;

pub struct SqliteIndicatorRepository {
    pool: SqlitePool,
}

impl SqliteIndicatorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndicatorRepository for SqliteIndicatorRepository {
    async fn upsert(&self, symbol: &str, timeframe: Timeframe, rows: &[IndicatorRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO indicators (time, symbol, timeframe, ema_9, ema_14, ema_21, trend)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (time, symbol, timeframe) DO UPDATE SET
                    ema_9 = excluded.ema_9,
                    ema_14 = excluded.ema_14,
                    ema_21 = excluded.ema_21,
                    trend = excluded.trend
                "#,
            )
            .bind(row.time.timestamp())
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(row.ema_9)
            .bind(row.ema_14)
            .bind(row.ema_21)
            .bind(row.trend.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to upsert indicator row")?;
        }

        tx.commit().await?;
        Ok(())
    }
}
