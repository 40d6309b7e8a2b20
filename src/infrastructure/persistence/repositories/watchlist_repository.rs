use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::market::Timeframe;
use crate::domain::repositories::WatchlistRepository;

pub struct SqliteWatchlistRepository {
    pool: SqlitePool,
}

impl SqliteWatchlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatchlistRepository for SqliteWatchlistRepository {
    async fn active(&self) -> Result<Vec<(String, Timeframe, String)>> {
        let rows = sqlx::query("SELECT symbol, timeframe, exchange FROM watchlist WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load watchlist")?;

        rows.iter()
            .map(|row| {
                let timeframe: String = row.try_get("timeframe")?;
                Ok((
                    row.try_get("symbol")?,
                    Timeframe::from_str(&timeframe)?,
                    row.try_get("exchange")?,
                ))
            })
            .collect()
    }

    async fn add(&self, symbol: &str, timeframe: Timeframe, exchange: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlist (symbol, timeframe, exchange, is_active, added_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT (symbol, timeframe) DO UPDATE SET
                exchange = excluded.exchange,
                is_active = 1
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(exchange)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to add watchlist entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::WatchlistRepository as _;
    use crate::infrastructure::persistence::Database;

    #[tokio::test]
    async fn test_add_and_list_active() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteWatchlistRepository::new(db.pool.clone());

        repo.add("BTC/USDT", Timeframe::OneHour, "binance").await.unwrap();
        repo.add("ETH/USDT", Timeframe::FiveMin, "binance").await.unwrap();
        // Re-adding the same pair keeps the key unique.
        repo.add("BTC/USDT", Timeframe::OneHour, "bybit").await.unwrap();

        let mut active = repo.active().await.unwrap();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            active,
            vec![
                ("BTC/USDT".to_string(), Timeframe::OneHour, "bybit".to_string()),
                ("ETH/USDT".to_string(), Timeframe::FiveMin, "binance".to_string()),
            ]
        );
    }
}
