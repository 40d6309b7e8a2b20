use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::domain::analysis::NewZone;
use crate::domain::market::Timeframe;
use crate::domain::repositories::ZoneRepository;

pub struct SqliteZoneRepository {
    pool: SqlitePool,
}

impl SqliteZoneRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ZoneRepository for SqliteZoneRepository {
    async fn replace(&self, symbol: &str, timeframe: Timeframe, zones: &[NewZone]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM zones WHERE symbol = ? AND timeframe = ?")
            .bind(symbol)
            .bind(timeframe.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to clear zones")?;

        let now = Utc::now().timestamp();
        for zone in zones {
            sqlx::query(
                r#"
                INSERT INTO zones
                    (time, symbol, timeframe, zone_type, center_price,
                     top_price, bottom_price, start_bar, end_bar, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(zone.time.timestamp())
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(zone.zone_type.as_str())
            .bind(zone.center_price)
            .bind(zone.top_price)
            .bind(zone.bottom_price)
            .bind(zone.start_bar)
            .bind(zone.end_bar)
            .execute(&mut *tx)
            .await
            .context("Failed to insert zone")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn zone_tp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        is_long: bool,
        entry_price: f64,
    ) -> Result<Option<f64>> {
        let row = if is_long {
            sqlx::query(
                r#"
                SELECT bottom_price AS target FROM zones
                WHERE symbol = ? AND timeframe = ?
                  AND zone_type = 'SUPPLY' AND center_price > ?
                ORDER BY center_price ASC
                LIMIT 1
                "#,
            )
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(entry_price)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT top_price AS target FROM zones
                WHERE symbol = ? AND timeframe = ?
                  AND zone_type = 'DEMAND' AND center_price < ?
                ORDER BY center_price DESC
                LIMIT 1
                "#,
            )
            .bind(symbol)
            .bind(timeframe.as_str())
            .bind(entry_price)
            .fetch_optional(&self.pool)
            .await?
        };

        Ok(row.map(|r| r.try_get("target")).transpose()?)
    }
}
