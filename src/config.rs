use anyhow::{Context, Result};
use std::env;

/// Runtime configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Absent ⇒ the in-process KV store (single-worker deployments).
    pub redis_url: Option<String>,
    pub default_exchange: String,
    pub auto_refresh_interval_minutes: u64,
    pub agent_cycle_interval_minutes: u64,
    // Live-trading credentials (unused in paper mode)
    pub exchange_wallet_address: String,
    pub exchange_api_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/revtrade.db".to_string());
        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        let default_exchange = env::var("DEFAULT_EXCHANGE").unwrap_or_else(|_| "binance".to_string());

        let auto_refresh_interval_minutes = env::var("AUTO_REFRESH_INTERVAL_MINUTES")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("Invalid AUTO_REFRESH_INTERVAL_MINUTES")?;
        let agent_cycle_interval_minutes = env::var("AGENT_CYCLE_INTERVAL_MINUTES")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("Invalid AGENT_CYCLE_INTERVAL_MINUTES")?;

        let exchange_wallet_address = env::var("EXCHANGE_WALLET_ADDRESS").unwrap_or_default();
        let exchange_api_secret = env::var("EXCHANGE_API_SECRET").unwrap_or_default();

        Ok(Self {
            database_url,
            redis_url,
            default_exchange,
            auto_refresh_interval_minutes,
            agent_cycle_interval_minutes,
            exchange_wallet_address,
            exchange_api_secret,
        })
    }

    /// The pipeline ticks at the faster of the two intervals.
    pub fn pipeline_interval_minutes(&self) -> u64 {
        self.auto_refresh_interval_minutes
            .min(self.agent_cycle_interval_minutes)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_interval_takes_the_minimum() {
        let config = Config {
            database_url: String::new(),
            redis_url: None,
            default_exchange: "binance".into(),
            auto_refresh_interval_minutes: 5,
            agent_cycle_interval_minutes: 2,
            exchange_wallet_address: String::new(),
            exchange_api_secret: String::new(),
        };
        assert_eq!(config.pipeline_interval_minutes(), 2);
    }
}
