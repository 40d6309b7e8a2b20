//! Binance klines REST fetcher behind the `MarketDataFetcher` port.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use std::time::Duration;
use tracing::debug;

use crate::domain::market::{OhlcvBar, Timeframe};
use crate::domain::ports::MarketDataFetcher;

const KLINES_URL: &str = "https://api.binance.com/api/v3/klines";

pub struct BinanceFetcher {
    http: ClientWithMiddleware,
}

impl Default for BinanceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceFetcher {
    pub fn new() -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(5);
        let http = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();
        Self { http }
    }

    /// "BTC/USDT" → "BTCUSDT".
    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn parse_kline(entry: &serde_json::Value) -> Result<OhlcvBar> {
        let arr = entry.as_array().ok_or_else(|| anyhow!("kline entry is not an array"))?;
        if arr.len() < 6 {
            return Err(anyhow!("kline entry too short: {} fields", arr.len()));
        }

        let ms = arr[0].as_i64().ok_or_else(|| anyhow!("invalid kline timestamp"))?;
        let price = |i: usize| -> Result<f64> {
            arr[i]
                .as_str()
                .ok_or_else(|| anyhow!("kline field {i} is not a string"))?
                .parse()
                .with_context(|| format!("kline field {i} is not numeric"))
        };

        Ok(OhlcvBar {
            time: Utc.timestamp_millis_opt(ms).single().ok_or_else(|| anyhow!("kline timestamp out of range"))?,
            open: price(1)?,
            high: price(2)?,
            low: price(3)?,
            close: price(4)?,
            volume: price(5)?,
        })
    }
}

#[async_trait]
impl MarketDataFetcher for BinanceFetcher {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OhlcvBar>> {
        let venue_symbol = Self::venue_symbol(symbol);
        let mut request = self.http.get(KLINES_URL).query(&[
            ("symbol", venue_symbol.as_str()),
            ("interval", timeframe.as_str()),
            ("limit", &limit.to_string()),
        ]);
        if let Some(since) = since {
            request = request.query(&[("startTime", since.timestamp_millis().to_string())]);
        }

        let resp = request.send().await.context("Binance klines request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Binance klines HTTP {status}: {body}"));
        }

        let payload: serde_json::Value = resp.json().await.context("Binance klines payload is not JSON")?;
        let entries = payload
            .as_array()
            .ok_or_else(|| anyhow!("Binance klines payload is not an array"))?;

        let mut bars: Vec<OhlcvBar> = entries.iter().map(Self::parse_kline).collect::<Result<_>>()?;
        bars.sort_by_key(|b| b.time);

        debug!(symbol, timeframe = %timeframe, bars = bars.len(), "fetched klines");
        Ok(bars)
    }
}
