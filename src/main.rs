use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use revtrade::application::analysis_service::AnalysisService;
use revtrade::application::broker::{AgentOrchestrator, PositionManager, SignalEvaluator};
use revtrade::application::ingestion::IngestionService;
use revtrade::application::pipeline::PipelineScheduler;
use revtrade::config::Config;
use revtrade::domain::ports::{DistributedStore, ExchangeAdapter, MarketDataFetcher};
use revtrade::infrastructure::exchange::HyperliquidAdapter;
use revtrade::infrastructure::fetcher::BinanceFetcher;
use revtrade::infrastructure::kv::{MemoryStore, RedisStore};
use revtrade::infrastructure::persistence::repositories::{
    SqliteAgentLogRepository, SqliteAgentRepository, SqliteAnalysisRunRepository,
    SqliteIndicatorRepository, SqliteOhlcvRepository, SqlitePositionRepository,
    SqliteSignalRepository, SqliteWatchlistRepository, SqliteZoneRepository,
};
use revtrade::infrastructure::persistence::Database;

/// Reversal-detection trading agents.
#[derive(Parser, Debug)]
#[command(name = "revtrade", version, about)]
struct Args {
    /// Run a single pipeline pass and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    info!("revtrade starting");

    let db = Database::new(&config.database_url).await?;
    let pool = db.pool.clone();

    // Repositories
    let ohlcv = Arc::new(SqliteOhlcvRepository::new(pool.clone()));
    let signals = Arc::new(SqliteSignalRepository::new(pool.clone()));
    let zones = Arc::new(SqliteZoneRepository::new(pool.clone()));
    let runs = Arc::new(SqliteAnalysisRunRepository::new(pool.clone()));
    let indicators = Arc::new(SqliteIndicatorRepository::new(pool.clone()));
    let watchlist = Arc::new(SqliteWatchlistRepository::new(pool.clone()));
    let agents = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let positions = Arc::new(SqlitePositionRepository::new(pool.clone()));
    let logs = Arc::new(SqliteAgentLogRepository::new(pool.clone()));

    // Shared infrastructure
    let kv: Arc<dyn DistributedStore> = match &config.redis_url {
        Some(url) => {
            info!(url, "using Redis for locks and throttles");
            Arc::new(RedisStore::connect(url).await?)
        }
        None => {
            info!("no REDIS_URL set, using the in-process KV store");
            Arc::new(MemoryStore::new())
        }
    };
    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(HyperliquidAdapter::new(
        config.exchange_wallet_address.clone(),
        config.exchange_api_secret.clone(),
    ));
    let fetcher: Arc<dyn MarketDataFetcher> = Arc::new(BinanceFetcher::new());

    // Services
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
        exchange.clone(),
        evaluator.clone(),
    ));
    let orchestrator = Arc::new(AgentOrchestrator::new(
        agents.clone(),
        positions,
        signals,
        ohlcv,
        logs,
        kv.clone(),
        exchange,
        ingestion.clone(),
        analysis.clone(),
        evaluator,
        manager,
    ));

    let pipeline = PipelineScheduler::new(
        watchlist,
        agents,
        kv,
        ingestion,
        analysis,
        orchestrator,
        config.default_exchange.clone(),
        Duration::from_secs(config.pipeline_interval_minutes() * 60),
    );

    if args.once {
        pipeline.run_once(true).await?;
        info!("single pipeline pass complete");
        return Ok(());
    }

    pipeline.run_forever().await;
    Ok(())
}
