//! Hyperliquid-style exchange adapter.
//!
//! Paper mode simulates fills locally; live mode routes market-like IOC
//! orders to the venue. EUR-denominated stakes are converted through a
//! cached EUR/USDT rate before sizing. All HTTP goes through the
//! retrying client (exponential backoff, 5 attempts, 1 s base, 30 s
//! cap).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::domain::ports::ExchangeAdapter;
use crate::domain::trading::{AgentMode, OrderResult, Side};

const INFO_URL: &str = "https://api.hyperliquid.xyz/info";
const EXCHANGE_URL: &str = "https://api.hyperliquid.xyz/exchange";
const RATE_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

const MAX_RETRIES: u32 = 5;
const RATE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Last-resort USDT-per-EUR rate when neither the API nor the cache
/// can answer.
const FALLBACK_EUR_USDT_RATE: f64 = 1.09;

pub struct HyperliquidAdapter {
    http: ClientWithMiddleware,
    wallet_address: String,
    api_secret: String,
    rate_cache: Mutex<Option<(f64, Instant)>>,
    paper_counter: AtomicU64,
}

impl HyperliquidAdapter {
    pub fn new(wallet_address: String, api_secret: String) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(MAX_RETRIES);
        let http = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        Self {
            http,
            wallet_address,
            api_secret,
            rate_cache: Mutex::new(None),
            paper_counter: AtomicU64::new(0),
        }
    }

    fn coin_of(symbol: &str) -> &str {
        if let Some((coin, _)) = symbol.split_once('/') {
            coin
        } else {
            symbol.strip_suffix("USDT").unwrap_or(symbol)
        }
    }

    /// USDT per EUR, cached for 60 s; falls back to the last-known
    /// rate, then the fixed default.
    async fn eur_usdt_rate(&self) -> f64 {
        let mut cache = self.rate_cache.lock().await;
        if let Some((rate, fetched_at)) = *cache {
            if fetched_at.elapsed() < RATE_CACHE_TTL {
                return rate;
            }
        }

        let fetched = async {
            let resp = self
                .http
                .get(RATE_URL)
                .query(&[("ids", "tether"), ("vs_currencies", "eur")])
                .send()
                .await
                .ok()?;
            let data: serde_json::Value = resp.json().await.ok()?;
            let eur_per_usdt = data.get("tether")?.get("eur")?.as_f64()?;
            (eur_per_usdt > 0.0).then(|| 1.0 / eur_per_usdt)
        }
        .await;

        match fetched {
            Some(rate) => {
                info!(rate, "EUR/USDT rate refreshed");
                *cache = Some((rate, Instant::now()));
                rate
            }
            None => match *cache {
                Some((rate, _)) => {
                    warn!(rate, "EUR/USDT fetch failed, using last-known rate");
                    rate
                }
                None => {
                    warn!(rate = FALLBACK_EUR_USDT_RATE, "EUR/USDT fetch failed, using fixed fallback");
                    FALLBACK_EUR_USDT_RATE
                }
            },
        }
    }

    fn paper_order_id(&self, prefix: &str) -> String {
        let n = self.paper_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", prefix, n, chrono::Utc::now().timestamp())
    }

    async fn live_order(
        &self,
        symbol: &str,
        is_buy: bool,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    ) -> OrderResult {
        let coin = Self::coin_of(symbol);
        let payload = json!({
            "action": {
                "type": "order",
                "orders": [{
                    "coin": coin,
                    "is_buy": is_buy,
                    "limit_px": price.to_string(),
                    "sz": quantity.to_string(),
                    "reduce_only": reduce_only,
                    "order_type": { "limit": { "tif": "Ioc" } },
                }],
                "grouping": "na",
            },
            "nonce": chrono::Utc::now().timestamp_millis(),
            "wallet": self.wallet_address,
        });

        let response = self
            .http
            .post(EXCHANGE_URL)
            .bearer_auth(&self.api_secret)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let order_id = body
                    .pointer("/response/data/statuses/0/resting/oid")
                    .and_then(|v| v.as_i64())
                    .map(|oid| oid.to_string());
                OrderResult::live_fill(order_id, price, quantity)
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                error!(%status, body = %text, "live order rejected");
                OrderResult::failed(format!("HTTP {status}: {text}"))
            }
            Err(e) => {
                error!(error = %e, "live order transport failed");
                OrderResult::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    async fn market_open(
        &self,
        symbol: &str,
        side: Side,
        eur_amount: f64,
        current_price: f64,
        mode: AgentMode,
    ) -> OrderResult {
        let usdt_amount = self.eur_to_usdt(eur_amount).await;
        let quantity = usdt_amount / current_price;

        match mode {
            AgentMode::Paper => {
                info!(
                    symbol,
                    %side,
                    quantity,
                    price = current_price,
                    usdt = usdt_amount,
                    "[paper] opening position"
                );
                OrderResult::paper_fill(self.paper_order_id("PAPER"), current_price, quantity)
            }
            AgentMode::Live => {
                info!(symbol, %side, quantity, price = current_price, "[live] opening position");
                self.live_order(symbol, side == Side::Long, quantity, current_price, false)
                    .await
            }
        }
    }

    async fn market_close(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        current_price: f64,
        mode: AgentMode,
    ) -> OrderResult {
        match mode {
            AgentMode::Paper => {
                info!(symbol, %side, quantity, price = current_price, "[paper] closing position");
                OrderResult::paper_fill(self.paper_order_id("PAPER-CLOSE"), current_price, quantity)
            }
            AgentMode::Live => {
                info!(symbol, %side, quantity, price = current_price, "[live] closing position");
                // Closing a LONG sells, closing a SHORT buys back.
                self.live_order(symbol, side == Side::Short, quantity, current_price, true)
                    .await
            }
        }
    }

    async fn mid_price(&self, symbol: &str) -> Option<f64> {
        let coin = Self::coin_of(symbol);
        let resp = self
            .http
            .post(INFO_URL)
            .json(&json!({ "type": "allMids" }))
            .send()
            .await
            .ok()?;
        let data: serde_json::Value = resp.json().await.ok()?;
        data.get(coin)?.as_str()?.parse().ok()
    }

    async fn eur_to_usdt(&self, eur_amount: f64) -> f64 {
        eur_amount * self.eur_usdt_rate().await
    }

    async fn usdt_to_eur(&self, usdt_amount: f64) -> f64 {
        usdt_amount / self.eur_usdt_rate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_extraction() {
        assert_eq!(HyperliquidAdapter::coin_of("BTC/USDT"), "BTC");
        assert_eq!(HyperliquidAdapter::coin_of("ETHUSDT"), "ETH");
        assert_eq!(HyperliquidAdapter::coin_of("SOL"), "SOL");
    }

    #[tokio::test]
    async fn test_paper_fill_shape() {
        let adapter = HyperliquidAdapter::new(String::new(), String::new());
        // Seed the rate cache so the test never touches the network.
        *adapter.rate_cache.lock().await = Some((1.0, Instant::now()));

        let result = adapter
            .market_open("BTC/USDT", Side::Long, 100.0, 50.0, AgentMode::Paper)
            .await;
        assert!(result.success);
        assert!(result.is_paper);
        assert_eq!(result.filled_price, Some(50.0));
        assert_eq!(result.quantity, Some(2.0));
    }
}
