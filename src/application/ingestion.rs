//! OHLCV ingestion: pull bars from the external fetcher and upsert
//! them into the store.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::market::Timeframe;
use crate::domain::ports::MarketDataFetcher;
use crate::domain::repositories::OhlcvRepository;

pub struct IngestionService {
    fetcher: Arc<dyn MarketDataFetcher>,
    ohlcv: Arc<dyn OhlcvRepository>,
}

impl IngestionService {
    pub fn new(fetcher: Arc<dyn MarketDataFetcher>, ohlcv: Arc<dyn OhlcvRepository>) -> Self {
        Self { fetcher, ohlcv }
    }

    /// Fetch up to `limit` bars and upsert them keyed by
    /// (time, symbol, timeframe). Returns the number of bars stored.
    pub async fn fetch_and_store(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let bars = self.fetcher.fetch_ohlcv(symbol, timeframe, limit, since).await?;
        if bars.is_empty() {
            return Ok(0);
        }

        let stored = self.ohlcv.upsert_bars(symbol, timeframe, &bars).await?;
        info!(symbol, timeframe = %timeframe, bars = stored, "stored OHLCV bars");
        Ok(stored)
    }
}
