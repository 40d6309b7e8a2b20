use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// SQLite pool wrapper; creates the schema on connect.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ohlcv (
                time INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (time, symbol, timeframe)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create ohlcv table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                bar_index INTEGER NOT NULL,
                price REAL NOT NULL,
                actual_price REAL NOT NULL,
                is_bullish BOOLEAN NOT NULL,
                is_preview BOOLEAN NOT NULL DEFAULT 0,
                signal_label TEXT NOT NULL DEFAULT 'REVERSAL',
                detected_at INTEGER,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_signals_key
            ON signals (time, symbol, timeframe, is_bullish);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signals unique index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                zone_type TEXT NOT NULL,
                center_price REAL NOT NULL,
                top_price REAL NOT NULL,
                bottom_price REAL NOT NULL,
                start_bar INTEGER NOT NULL,
                end_bar INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create zones table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                sensitivity TEXT NOT NULL DEFAULT 'Medium',
                signal_mode TEXT NOT NULL DEFAULT 'Confirmed Only',
                atr_multiplier REAL,
                current_atr REAL,
                threshold REAL,
                current_trend TEXT,
                total_signals INTEGER DEFAULT 0,
                total_zones INTEGER DEFAULT 0,
                bars_analyzed INTEGER DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create analysis_runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indicators (
                time INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                ema_9 REAL,
                ema_14 REAL,
                ema_21 REAL,
                trend TEXT,
                PRIMARY KEY (time, symbol, timeframe)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create indicators table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                exchange TEXT NOT NULL DEFAULT 'binance',
                is_active BOOLEAN NOT NULL DEFAULT 1,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (symbol, timeframe)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchlist table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                trade_amount REAL NOT NULL DEFAULT 100.0,
                balance REAL NOT NULL DEFAULT 100.0,
                is_active BOOLEAN NOT NULL DEFAULT 0,
                mode TEXT NOT NULL DEFAULT 'paper',
                sensitivity TEXT NOT NULL DEFAULT 'Medium',
                signal_mode TEXT NOT NULL DEFAULT 'Confirmed Only',
                analysis_limit INTEGER NOT NULL DEFAULT 500,
                confirmation_bars INTEGER NOT NULL DEFAULT 0,
                method TEXT NOT NULL DEFAULT 'average',
                atr_length INTEGER NOT NULL DEFAULT 5,
                average_length INTEGER NOT NULL DEFAULT 5,
                absolute_reversal REAL NOT NULL DEFAULT 0.5,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create agents table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL,
                stop_loss REAL NOT NULL,
                original_stop_loss REAL NOT NULL,
                take_profit REAL,
                tp2 REAL,
                quantity REAL NOT NULL,
                original_quantity REAL NOT NULL,
                invested_eur REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                partial_closed BOOLEAN NOT NULL DEFAULT 0,
                partial_pnl REAL,
                best_price REAL,
                entry_signal_time INTEGER,
                entry_signal_is_bullish BOOLEAN,
                exit_signal_id INTEGER,
                pnl REAL,
                pnl_percent REAL,
                unrealized_pnl REAL,
                unrealized_pnl_percent REAL,
                current_price REAL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create agent_positions table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_agent_status
            ON agent_positions (agent_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                details TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create agent_logs table")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.init().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_backed_database_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/test.db", dir.path().display());
        let db = Database::new(&url).await.unwrap();

        sqlx::query("INSERT INTO watchlist (symbol, timeframe, exchange, is_active, added_at) VALUES ('BTC/USDT', '1h', 'binance', 1, 0)")
            .execute(&db.pool)
            .await
            .unwrap();
    }
}
