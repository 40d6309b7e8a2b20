use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::market::{OhlcvBar, Timeframe};
use crate::domain::trading::{AgentMode, OrderResult, Side};

/// External OHLCV source. Errors are recoverable: the callers throttle
/// and retry on the next cycle.
#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    /// Chronologically ordered bars, most recent `limit` (or since
    /// `since` when given).
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OhlcvBar>>;
}

/// Executes or simulates market orders and owns the EUR↔USDT rate.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Open a position for `eur_amount`. Paper mode fills synthetically
    /// at `current_price`; live mode converts EUR→USDT first and routes
    /// to the venue. Failures come back in the result, never as a fill.
    async fn market_open(
        &self,
        symbol: &str,
        side: Side,
        eur_amount: f64,
        current_price: f64,
        mode: AgentMode,
    ) -> OrderResult;

    /// Close `quantity` of a position.
    async fn market_close(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        current_price: f64,
        mode: AgentMode,
    ) -> OrderResult;

    /// Current mid price, used when no candle is available.
    async fn mid_price(&self, symbol: &str) -> Option<f64>;

    async fn eur_to_usdt(&self, eur_amount: f64) -> f64;

    async fn usdt_to_eur(&self, usdt_amount: f64) -> f64;
}

/// Distributed KV with TTLs and non-blocking advisory locks,
/// coordinating workers across processes.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()>;

    /// Single-try lock acquisition. Returns a fencing token when the
    /// lock was acquired, `None` when another holder exists. The TTL
    /// bounds stuck locks across worker crashes.
    async fn try_lock(&self, name: &str, ttl_secs: u64) -> Result<Option<String>>;

    /// Release a lock if `token` still matches the holder.
    async fn unlock(&self, name: &str, token: &str) -> Result<()>;
}
