//! In-memory doubles for the exchange and fetcher ports, used by the
//! integration tests and offline runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::market::{OhlcvBar, Timeframe};
use crate::domain::ports::{ExchangeAdapter, MarketDataFetcher};
use crate::domain::trading::{AgentMode, OrderResult, Side};

/// One executed (or attempted) order, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub is_open: bool,
    pub mode: AgentMode,
}

/// Deterministic exchange double. The EUR/USDT rate is fixed at
/// construction; open/close failures can be toggled per test.
pub struct MockExchange {
    /// USDT per EUR.
    pub rate: f64,
    fail_open: AtomicBool,
    fail_close: AtomicBool,
    mid_price: Mutex<Option<f64>>,
    orders: Mutex<Vec<RecordedOrder>>,
    counter: AtomicU64,
}

impl MockExchange {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            fail_open: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            mid_price: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub async fn set_mid_price(&self, price: Option<f64>) {
        *self.mid_price.lock().await = price;
    }

    pub async fn orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().await.clone()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn market_open(
        &self,
        symbol: &str,
        side: Side,
        eur_amount: f64,
        current_price: f64,
        mode: AgentMode,
    ) -> OrderResult {
        if self.fail_open.load(Ordering::SeqCst) {
            return OrderResult::failed("mock open failure");
        }

        let quantity = eur_amount * self.rate / current_price;
        self.orders.lock().await.push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: current_price,
            is_open: true,
            mode,
        });

        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        match mode {
            AgentMode::Paper => OrderResult::paper_fill(format!("MOCK-{id}"), current_price, quantity),
            AgentMode::Live => OrderResult::live_fill(Some(format!("MOCK-{id}")), current_price, quantity),
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
        if self.fail_close.load(Ordering::SeqCst) {
            return OrderResult::failed("mock close failure");
        }

        self.orders.lock().await.push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: current_price,
            is_open: false,
            mode,
        });

        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        match mode {
            AgentMode::Paper => OrderResult::paper_fill(format!("MOCK-CLOSE-{id}"), current_price, quantity),
            AgentMode::Live => OrderResult::live_fill(Some(format!("MOCK-CLOSE-{id}")), current_price, quantity),
        }
    }

    async fn mid_price(&self, _symbol: &str) -> Option<f64> {
        *self.mid_price.lock().await
    }

    async fn eur_to_usdt(&self, eur_amount: f64) -> f64 {
        eur_amount * self.rate
    }

    async fn usdt_to_eur(&self, usdt_amount: f64) -> f64 {
        usdt_amount / self.rate
    }
}

/// Fetcher double returning a pre-seeded bar series.
#[derive(Default)]
pub struct MockFetcher {
    bars: Mutex<Vec<OhlcvBar>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, bars: Vec<OhlcvBar>) {
        *self.bars.lock().await = bars;
    }
}

#[async_trait]
impl MarketDataFetcher for MockFetcher {
    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OhlcvBar>> {
        let bars = self.bars.lock().await;
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }
}
