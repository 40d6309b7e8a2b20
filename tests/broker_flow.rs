//! Broker integration tests over in-memory SQLite, the mock exchange
//! and the in-process KV store: position lifecycle invariants, filter
//! rejections, whipsaw cooldown and live-failure handling.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use sqlx::Row;

use revtrade::application::analysis_service::AnalysisService;
use revtrade::application::broker::{AgentOrchestrator, PositionManager, SignalEvaluator};
use revtrade::application::ingestion::IngestionService;
use revtrade::domain::analysis::NewSignal;
use revtrade::domain::market::{OhlcvBar, Timeframe};
use revtrade::domain::ports::{DistributedStore, ExchangeAdapter, MarketDataFetcher};
use revtrade::domain::repositories::{
    AgentRepository, OhlcvRepository, PositionRepository, SignalRepository,
};
use revtrade::domain::trading::position::NewPosition;
use revtrade::domain::trading::{Agent, AgentMode, CloseReason, NewAgent, PositionStatus, Side};
use revtrade::infrastructure::kv::MemoryStore;
use revtrade::infrastructure::mock::{MockExchange, MockFetcher};
use revtrade::infrastructure::persistence::repositories::{
    SqliteAgentLogRepository, SqliteAgentRepository, SqliteAnalysisRunRepository,
    SqliteIndicatorRepository, SqliteOhlcvRepository, SqlitePositionRepository,
    SqliteSignalRepository, SqliteZoneRepository,
};
use revtrade::infrastructure::persistence::Database;

struct Harness {
    pool: sqlx::SqlitePool,
    agents: Arc<SqliteAgentRepository>,
    positions: Arc<SqlitePositionRepository>,
    signals: Arc<SqliteSignalRepository>,
    ohlcv: Arc<SqliteOhlcvRepository>,
    exchange: Arc<MockExchange>,
    evaluator: Arc<SignalEvaluator>,
    manager: Arc<PositionManager>,
    orchestrator: Arc<AgentOrchestrator>,
}

async fn harness(rate: f64) -> Harness {
    let db = Database::in_memory().await.unwrap();
    let pool = db.pool.clone();

    let ohlcv = Arc::new(SqliteOhlcvRepository::new(pool.clone()));
    let signals = Arc::new(SqliteSignalRepository::new(pool.clone()));
    let zones = Arc::new(SqliteZoneRepository::new(pool.clone()));
    let runs = Arc::new(SqliteAnalysisRunRepository::new(pool.clone()));
    let indicators = Arc::new(SqliteIndicatorRepository::new(pool.clone()));
    let agents = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let positions = Arc::new(SqlitePositionRepository::new(pool.clone()));
    let logs = Arc::new(SqliteAgentLogRepository::new(pool.clone()));

    let kv: Arc<dyn DistributedStore> = Arc::new(MemoryStore::new());
    let exchange = Arc::new(MockExchange::new(rate));
    let exchange_dyn: Arc<dyn ExchangeAdapter> = exchange.clone();
    let fetcher: Arc<dyn MarketDataFetcher> = Arc::new(MockFetcher::new());

    let ingestion = Arc::new(IngestionService::new(fetcher, ohlcv.clone()));
    let analysis = Arc::new(AnalysisService::new(
        ohlcv.clone(),
        signals.clone(),
        zones.clone(),
        runs.clone(),
        indicators,
        kv.clone(),
    ));
    let evaluator = Arc::new(SignalEvaluator::new(signals.clone(), runs.clone(), positions.clone()));
    let manager = Arc::new(PositionManager::new(
        agents.clone(),
        positions.clone(),
        signals.clone(),
        zones,
        runs,
        ohlcv.clone(),
        logs.clone(),
        exchange_dyn.clone(),
        evaluator.clone(),
    ));
    let orchestrator = Arc::new(AgentOrchestrator::new(
        agents.clone(),
        positions.clone(),
        signals.clone(),
        ohlcv.clone(),
        logs,
        kv,
        exchange_dyn,
        ingestion,
        analysis,
        evaluator.clone(),
        manager.clone(),
    ));

    Harness {
        pool,
        agents,
        positions,
        signals,
        ohlcv,
        exchange,
        evaluator,
        manager,
        orchestrator,
    }
}

async fn make_agent(h: &Harness, name: &str, timeframe: Timeframe, mode: AgentMode) -> Agent {
    let mut new_agent = NewAgent::new(name, "BTC/USDT", timeframe);
    new_agent.mode = mode;
    let agent = h.agents.create(&new_agent).await.unwrap();
    h.agents.set_active(agent.id, true).await.unwrap();
    h.agents.get(agent.id).await.unwrap().unwrap()
}

async fn insert_signal(h: &Harness, timeframe: Timeframe, offset_secs: i64, price: f64, is_bullish: bool) -> NewSignal {
    let signal = NewSignal {
        time: Utc::now() - Duration::seconds(offset_secs),
        bar_index: 0,
        price,
        actual_price: price,
        is_bullish,
        is_preview: false,
        label: "REVERSAL".into(),
        detected_at: Utc::now(),
    };
    h.signals.upsert("BTC/USDT", timeframe, std::slice::from_ref(&signal)).await.unwrap();
    signal
}

async fn skip_reasons(h: &Harness, agent_id: i64) -> Vec<String> {
    let rows = sqlx::query("SELECT action, details FROM agent_logs WHERE agent_id = ? ORDER BY id")
        .bind(agent_id)
        .fetch_all(&h.pool)
        .await
        .unwrap();
    rows.iter()
        .filter_map(|row| {
            let action: String = row.try_get("action").unwrap();
            let details: Option<String> = row.try_get("details").unwrap();
            if action == "TRADE_SKIPPED" {
                let parsed: serde_json::Value = serde_json::from_str(&details?).ok()?;
                Some(parsed["reason"].as_str()?.to_string())
            } else {
                None
            }
        })
        .collect()
}

async fn log_actions(h: &Harness, agent_id: i64) -> Vec<String> {
    let rows = sqlx::query("SELECT action FROM agent_logs WHERE agent_id = ? ORDER BY id")
        .bind(agent_id)
        .fetch_all(&h.pool)
        .await
        .unwrap();
    rows.iter().map(|r| r.try_get::<String, _>("action").unwrap()).collect()
}

fn new_position(agent: &Agent, side: Side, entry: f64, sl: f64, tp: f64, tp2: f64, qty: f64) -> NewPosition {
    NewPosition {
        agent_id: agent.id,
        symbol: agent.symbol.clone(),
        side,
        entry_price: entry,
        stop_loss: sl,
        take_profit: tp,
        tp2,
        quantity: qty,
        invested_eur: agent.trade_amount,
        entry_signal_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        entry_signal_is_bullish: side == Side::Long,
    }
}

// ── P9 / P10: open-path guards ───────────────────────────────

#[tokio::test]
async fn at_most_one_open_position_per_agent() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "guard-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let first = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 99.0, 103.0, 104.5, 1.0))
        .await
        .unwrap();
    assert!(first.is_some());

    // Second open must hit the guards: balance is zero AND a position
    // is already OPEN.
    let second = h
        .positions
        .try_open(&new_position(&agent, Side::Short, 100.0, 101.0, 97.0, 95.5, 1.0))
        .await
        .unwrap();
    assert!(second.is_none());

    let open = h.positions.open_positions(agent.id).await.unwrap();
    assert_eq!(open.len(), 1);

    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 0.0);
}

#[tokio::test]
async fn zero_balance_refuses_open() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "broke-agent", Timeframe::OneHour, AgentMode::Paper).await;
    h.agents.set_balance(agent.id, 0.0).await.unwrap();

    let opened = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 99.0, 103.0, 104.5, 1.0))
        .await
        .unwrap();
    assert!(opened.is_none());
    assert!(h.positions.open_positions(agent.id).await.unwrap().is_empty());
}

// ── Scenario 3: risk-floor rejection ─────────────────────────

#[tokio::test]
async fn risk_floor_rejects_tight_stop() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "floor-agent", Timeframe::OneHour, AgentMode::Paper).await;

    // Opposite pivot 0.20% below entry → SL anchor too close for 1h
    // (minimum 0.40%).
    insert_signal(&h, Timeframe::OneHour, 7200, 99.80, false).await;
    let entry_signal = insert_signal(&h, Timeframe::OneHour, 60, 100.0, true).await;
    let stored = h
        .signals
        .latest_confirmed_for("BTC/USDT", Timeframe::OneHour, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.time, entry_signal.time);

    let opened = h.manager.open_position(&agent, Side::Long, 100.0, &stored).await.unwrap();
    assert!(opened.is_none());

    assert!(h.positions.open_positions(agent.id).await.unwrap().is_empty());
    assert_eq!(skip_reasons(&h, agent.id).await, vec!["risk_too_small"]);

    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 100.0);
}

// ── Scenario 4: whipsaw cooldown ─────────────────────────────

#[tokio::test]
async fn whipsaw_cooldown_blocks_immediate_flip() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "whipsaw-agent", Timeframe::OneMin, AgentMode::Paper).await;

    // Entry signal (bullish), and an opposite bearish signal that
    // arrives after the entry.
    let entry = insert_signal(&h, Timeframe::OneMin, 600, 99.0, true).await;
    insert_signal(&h, Timeframe::OneMin, 30, 99.0, false).await;

    let stored_entry = h
        .signals
        .latest_confirmed_for("BTC/USDT", Timeframe::OneMin, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_entry.time, entry.time);

    let opened = h
        .manager
        .open_position(&agent, Side::Long, 100.0, &stored_entry)
        .await
        .unwrap()
        .expect("position should open");
    assert_eq!(opened.status, PositionStatus::Open);

    // One candle in store supplies the cycle's price context. Its
    // range stays inside the capped SL (99.7 on 1m) and TP1 (100.45)
    // so only the opposite-signal branch acts.
    let bar = OhlcvBar {
        time: Utc::now(),
        open: 100.1,
        high: 100.3,
        low: 99.8,
        close: 100.2,
        volume: 1000.0,
    };
    h.ohlcv.upsert_bars("BTC/USDT", Timeframe::OneMin, &[bar]).await.unwrap();

    // The cycle sees the fresh opposite reversal, closes the LONG and
    // refuses the immediate SHORT (position lived << 3 candles).
    h.orchestrator.run_agent_cycle(&agent).await.unwrap();

    assert!(h.positions.open_positions(agent.id).await.unwrap().is_empty());
    let closed = h.positions.get(opened.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);

    let reasons = skip_reasons(&h, agent.id).await;
    assert!(reasons.contains(&"whipsaw_cooldown".to_string()), "reasons: {reasons:?}");
}

// ── Scenario 5: two-stage take profit ────────────────────────

#[tokio::test]
async fn partial_then_full_take_profit() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "tp-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let mut pos = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 95.0, 115.0, 125.0, 1.0))
        .await
        .unwrap()
        .unwrap();

    // First touch: wick to 116 hits TP1.
    let fully_closed = h
        .manager
        .check_take_profit(&agent, &mut pos, 114.0, Some(110.0), Some(116.0))
        .await
        .unwrap();
    assert!(!fully_closed);

    let staged = h.positions.get(pos.id).await.unwrap().unwrap();
    assert_eq!(staged.status, PositionStatus::Open);
    assert!(staged.partial_closed);
    assert!((staged.quantity - 0.5).abs() < 1e-9);
    assert_eq!(staged.partial_pnl, Some(7.5));
    assert_eq!(staged.stop_loss, 100.0); // breakeven
    assert_eq!(staged.take_profit, Some(125.0)); // advanced to TP2

    // Second touch: wick to 126 hits TP2 and closes the rest.
    let mut staged = staged;
    let fully_closed = h
        .manager
        .check_take_profit(&agent, &mut staged, 124.0, Some(120.0), Some(126.0))
        .await
        .unwrap();
    assert!(fully_closed);

    let done = h.positions.get(pos.id).await.unwrap().unwrap();
    assert_eq!(done.status, PositionStatus::Closed);
    // (125 − 100) × 0.5 + 7.5 partial = 20.0 EUR.
    assert_eq!(done.pnl, Some(20.0));

    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 120.0);
}

// ── Scenario 6: live close failure ───────────────────────────

#[tokio::test]
async fn live_close_failure_keeps_position_open() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "live-agent", Timeframe::OneHour, AgentMode::Live).await;

    let pos = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 95.0, 115.0, 125.0, 1.0))
        .await
        .unwrap()
        .unwrap();

    h.exchange.set_fail_close(true);
    let closed = h
        .manager
        .close_position(&pos, Some(110.0), None, CloseReason::TakeProfit)
        .await
        .unwrap();
    assert!(closed.is_none());

    let still_open = h.positions.get(pos.id).await.unwrap().unwrap();
    assert_eq!(still_open.status, PositionStatus::Open);

    let agent_after = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent_after.balance, 0.0); // balance untouched

    assert!(log_actions(&h, agent.id).await.contains(&"ORDER_FAILED".to_string()));

    // Paper mode proceeds on the same failure.
    h.exchange.set_fail_close(false);
}

// ── P11: EUR balance restoration without rate re-conversion ──

#[tokio::test]
async fn close_restores_invested_plus_pnl_in_eur() {
    // USDT/EUR rate of 2.0: invested 100 EUR buys 200 USDT of stock.
    let h = harness(2.0).await;
    let agent = make_agent(&h, "fx-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let pos = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 95.0, 115.0, 125.0, 2.0))
        .await
        .unwrap()
        .unwrap();

    let closed = h
        .manager
        .close_position(&pos, Some(110.0), None, CloseReason::BearishReversal)
        .await
        .unwrap()
        .unwrap();

    // PnL: (110 − 100) × 2 = 20 USDT = 10 EUR; balance = 100 + 10.
    assert_eq!(closed.pnl, Some(10.0));
    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 110.0);
}

// ── Stop classification ──────────────────────────────────────

#[tokio::test]
async fn stop_exit_marks_position_stopped() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "stop-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let pos = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 98.0, 106.0, 109.0, 1.0))
        .await
        .unwrap()
        .unwrap();

    // Wick through the stop: exit at the SL level exactly.
    let closed = h
        .manager
        .check_stop_loss(&agent, &pos, 99.0, Some(97.5), Some(99.5))
        .await
        .unwrap();
    assert!(closed);

    let stopped = h.positions.get(pos.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, PositionStatus::Stopped);
    assert_eq!(stopped.exit_price, Some(98.0));
    assert_eq!(stopped.pnl, Some(-2.0));

    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 98.0);
}

// ── Same-cycle stop-out then re-entry ────────────────────────

#[tokio::test]
async fn balance_restored_by_stop_out_is_usable_in_the_same_cycle() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "restop-agent", Timeframe::OneMin, AgentMode::Paper).await;

    let opened = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 99.7, 110.0, 115.0, 1.0))
        .await
        .unwrap()
        .unwrap();

    // A fresh bearish reversal arrives, and the candle wicks through
    // the stop.
    insert_signal(&h, Timeframe::OneMin, 30, 101.0, false).await;
    let bar = OhlcvBar {
        time: Utc::now(),
        open: 100.1,
        high: 100.4,
        low: 99.5,
        close: 99.9,
        volume: 1000.0,
    };
    h.ohlcv.upsert_bars("BTC/USDT", Timeframe::OneMin, &[bar]).await.unwrap();

    h.orchestrator.run_agent_cycle(&agent).await.unwrap();

    // Maintenance stopped the LONG at the SL level...
    let stopped = h.positions.get(opened.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, PositionStatus::Stopped);
    assert_eq!(stopped.exit_price, Some(99.7));

    // ...and the restored balance funded the SHORT on the fresh signal
    // within the same cycle.
    let open = h.positions.open_positions(agent.id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].side, Side::Short);

    let reasons = skip_reasons(&h, agent.id).await;
    assert!(!reasons.contains(&"no_balance".to_string()), "reasons: {reasons:?}");
}

// ── Manual close ─────────────────────────────────────────────

#[tokio::test]
async fn manual_close_exits_at_latest_market_price() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "manual-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let pos = h
        .positions
        .try_open(&new_position(&agent, Side::Long, 100.0, 95.0, 115.0, 125.0, 1.0))
        .await
        .unwrap()
        .unwrap();

    // The market has moved since the open; a manual close must exit at
    // the latest stored price, not the entry.
    let bar = OhlcvBar {
        time: Utc::now(),
        open: 104.0,
        high: 105.5,
        low: 103.5,
        close: 105.0,
        volume: 1000.0,
    };
    h.ohlcv.upsert_bars("BTC/USDT", Timeframe::OneHour, &[bar]).await.unwrap();

    let closed = h.manager.close_manually(pos.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_price, Some(105.0));
    assert_eq!(closed.pnl, Some(5.0));

    let agent = h.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(agent.balance, 105.0);

    // Closing again is a no-op; a bogus id is an error.
    assert!(h.manager.close_manually(pos.id).await.unwrap().is_none());
    assert!(h.manager.close_manually(99_999).await.is_err());
}

// ── P13: duplicate detection survives signal-id churn ────────

#[tokio::test]
async fn duplicate_check_uses_stable_signal_key() {
    let h = harness(1.0).await;
    let agent = make_agent(&h, "dup-agent", Timeframe::OneHour, AgentMode::Paper).await;

    let signal_time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let signal = NewSignal {
        time: signal_time,
        bar_index: 10,
        price: 99.0,
        actual_price: 99.0,
        is_bullish: true,
        is_preview: false,
        label: "REVERSAL".into(),
        detected_at: Utc::now(),
    };
    h.signals.upsert("BTC/USDT", Timeframe::OneHour, &[signal]).await.unwrap();
    let first = h
        .signals
        .latest_confirmed("BTC/USDT", Timeframe::OneHour)
        .await
        .unwrap()
        .unwrap();

    let mut position = new_position(&agent, Side::Long, 100.0, 99.0, 103.0, 104.5, 1.0);
    position.entry_signal_time = first.time;
    position.entry_signal_is_bullish = first.is_bullish;
    h.positions.try_open(&position).await.unwrap().unwrap();

    // Re-analysis: delete + reinsert the signal; the id changes, the
    // key does not.
    h.signals.delete_pair("BTC/USDT", Timeframe::OneHour).await.unwrap();
    let reborn = NewSignal {
        time: signal_time,
        bar_index: 11,
        price: 99.1,
        actual_price: 99.1,
        is_bullish: true,
        is_preview: false,
        label: "REVERSAL".into(),
        detected_at: Utc::now(),
    };
    h.signals.upsert("BTC/USDT", Timeframe::OneHour, &[reborn]).await.unwrap();
    let second = h
        .signals
        .latest_confirmed("BTC/USDT", Timeframe::OneHour)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.id, second.id);

    assert!(h.evaluator.is_processed(agent.id, &second).await.unwrap());
}
