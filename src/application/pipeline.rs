//! The periodic pipeline driver: fetch → analyze → run agents, with
//! per-pair throttles and a heartbeat for liveness (and for the
//! detected_at backdating rule after an outage).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::application::analysis_service::{AnalysisRequest, AnalysisService, HEARTBEAT_KEY};
use crate::application::broker::AgentOrchestrator;
use crate::application::ingestion::IngestionService;
use crate::domain::market::Timeframe;
use crate::domain::ports::DistributedStore;
use crate::domain::repositories::{AgentRepository, WatchlistRepository};

/// TTL of the pipeline heartbeat key.
const HEARTBEAT_TTL_SECS: u64 = 600;

pub struct PipelineScheduler {
    watchlist: Arc<dyn WatchlistRepository>,
    agents: Arc<dyn AgentRepository>,
    kv: Arc<dyn DistributedStore>,
    ingestion: Arc<IngestionService>,
    analysis: Arc<AnalysisService>,
    orchestrator: Arc<AgentOrchestrator>,
    default_exchange: String,
    interval: Duration,
}

impl PipelineScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watchlist: Arc<dyn WatchlistRepository>,
        agents: Arc<dyn AgentRepository>,
        kv: Arc<dyn DistributedStore>,
        ingestion: Arc<IngestionService>,
        analysis: Arc<AnalysisService>,
        orchestrator: Arc<AgentOrchestrator>,
        default_exchange: String,
        interval: Duration,
    ) -> Self {
        Self {
            watchlist,
            agents,
            kv,
            ingestion,
            analysis,
            orchestrator,
            default_exchange,
            interval,
        }
    }

    /// Run forever with an immediate first tick. Ticks never overlap
    /// (each awaits the previous), and a late run coalesces instead of
    /// bursting.
    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut run_count: u64 = 0;
        loop {
            ticker.tick().await;
            run_count += 1;
            let is_startup = run_count == 1;
            let started = std::time::Instant::now();
            info!(cycle = run_count, is_startup, "pipeline run starting");

            if let Err(e) = self.run_once(is_startup).await {
                error!(error = %e, "pipeline run crashed");
            }

            info!(cycle = run_count, elapsed_s = started.elapsed().as_secs_f64(), "pipeline run done");

            // Heartbeat for /health and the post-outage backdating rule.
            if let Err(e) = self
                .kv
                .setex(HEARTBEAT_KEY, HEARTBEAT_TTL_SECS, &Utc::now().to_rfc3339())
                .await
            {
                warn!(error = %e, "failed to write pipeline heartbeat");
            }
        }
    }

    /// One full pipeline pass over the union of active watchlist pairs
    /// and active agent pairs, plus their higher timeframes.
    pub async fn run_once(&self, is_startup: bool) -> Result<()> {
        // ── Collect all (symbol, timeframe) pairs ──
        let mut all_pairs: HashMap<(String, Timeframe), String> = HashMap::new();

        for (symbol, timeframe, exchange) in self.watchlist.active().await? {
            all_pairs.insert((symbol, timeframe), exchange);
        }
        for (symbol, timeframe) in self.agents.active_pairs().await? {
            all_pairs
                .entry((symbol, timeframe))
                .or_insert_with(|| self.default_exchange.clone());
        }

        let htf_pairs: Vec<(String, Timeframe)> = all_pairs
            .keys()
            .filter_map(|(symbol, tf)| tf.higher().map(|htf| (symbol.clone(), htf)))
            .collect();
        for (symbol, htf) in htf_pairs {
            all_pairs
                .entry((symbol, htf))
                .or_insert_with(|| self.default_exchange.clone());
        }

        if all_pairs.is_empty() {
            debug!("no active watchlist entries or agents");
            return Ok(());
        }

        // ── Step 1: fetch, throttled per pair ──
        let mut fetched: Vec<(String, Timeframe)> = Vec::new();
        for (symbol, timeframe) in all_pairs.keys() {
            let throttle_key = format!("pipeline_fetch:{}:{}", symbol, timeframe);
            if !is_startup && self.kv.get(&throttle_key).await?.is_some() {
                continue;
            }

            match self.ingestion.fetch_and_store(symbol, *timeframe, 500, None).await {
                Ok(count) => {
                    fetched.push((symbol.clone(), *timeframe));
                    self.kv
                        .setex(&throttle_key, timeframe.fetch_throttle_secs(), "1")
                        .await?;
                    info!(symbol = %symbol, timeframe = %timeframe, bars = count, "pipeline fetched");
                }
                Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "pipeline fetch error"),
            }
        }

        // ── Step 2: analysis for freshly fetched pairs ──
        let mut analyzed = 0usize;
        for (symbol, timeframe) in &fetched {
            let request = match self.agents.first_active_for_pair(symbol, *timeframe).await {
                Ok(Some(agent)) => AnalysisRequest::from_agent(&agent),
                _ => AnalysisRequest::new(symbol, *timeframe),
            };
            match self.analysis.run_analysis(&request).await {
                Ok(_) => analyzed += 1,
                Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "pipeline analysis error"),
            }
        }
        info!(fetched = fetched.len(), analyzed, "pipeline fetch/analyze step done");

        // ── Step 3: run all active agents ──
        if let Err(e) = self.orchestrator.run_all_active_agents().await {
            error!(error = %e, "agent cycle step failed");
        }

        Ok(())
    }
}
