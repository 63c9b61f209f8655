//! Main entry point for the stocksage signal service.
//!
//! Wires the store, providers, coordinator and background jobs together,
//! then runs one proactive analysis pass over the configured watchlist so
//! every tracked instrument has a fresh decision.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use stocksage::engine::{
    DecisionSourceConfig, EngineConfig, FetchCoordinator, LlmDecisionSource, MarketDataConfig,
    RequestMode, RetentionSweeper, SqliteStore, WeeklyReviewConfig, WeeklyReviewScheduler,
    YahooChartSource,
};
use stocksage::Exchange;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting stocksage signal service");

    let db_path = std::env::var("STOCKSAGE_DB").unwrap_or_else(|_| "./stocksage.db".to_string());
    let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;

    let config = EngineConfig::default();
    let store = SqliteStore::open(&db_path, config.cache_ttl).await?;

    let http = reqwest::Client::new();
    let market = Arc::new(YahooChartSource::new(
        http.clone(),
        MarketDataConfig::default(),
    ));
    let decisions = Arc::new(LlmDecisionSource::new(
        http,
        DecisionSourceConfig::new(api_key),
    ));

    let coordinator = Arc::new(FetchCoordinator::new(
        store.clone(),
        market.clone(),
        decisions.clone(),
        config.clone(),
    ));

    // Background jobs: retention sweeps and the weekly review.
    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.sweep_interval,
        config.cache_retention,
        config.decision_retention,
    );
    tokio::spawn(sweeper.run());

    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market.clone(),
        decisions.clone(),
        WeeklyReviewConfig::default(),
    );
    tokio::spawn(scheduler.run());

    // Proactive pass: make sure every watchlist instrument has a fresh
    // analysis; fresh cache hits cost nothing.
    for raw in watchlist() {
        let (symbol, exchange) = match raw.split_once(':') {
            Some((symbol, exchange)) => (
                symbol.to_string(),
                Exchange::from_str(exchange).unwrap_or(Exchange::Nse),
            ),
            None => (raw.clone(), Exchange::Nse),
        };

        match coordinator
            .analyze(&symbol, exchange, RequestMode::Scheduled)
            .await
        {
            Ok(analysis) => {
                let action = analysis
                    .decision
                    .as_ref()
                    .map(|d| d.signal.action.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    key = %analysis.key,
                    %action,
                    cached = analysis.cached,
                    stale = analysis.stale,
                    "watchlist analysis ready"
                );
                if let Some(e) = analysis.decision_error {
                    warn!(key = %analysis.key, error = %e, "decision unavailable this pass");
                }
            }
            Err(e) => error!(%symbol, error = %e, "watchlist analysis failed"),
        }
    }

    match coordinator.performance_summary().await {
        Ok(summary) => info!(
            total_trades = summary.total_trades,
            win_rate = %format!("{:.1}%", summary.win_rate_percent),
            avg_pnl = %format!("{:.2}%", summary.average_pnl_percent),
            "track record to date"
        ),
        Err(e) => warn!(error = %e, "performance summary unavailable"),
    }

    info!("Watchlist pass complete; background jobs running. Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

/// Instruments to keep analyzed, `SYMBOL` or `SYMBOL:EXCHANGE`,
/// comma-separated in `STOCKSAGE_WATCHLIST`.
fn watchlist() -> Vec<String> {
    std::env::var("STOCKSAGE_WATCHLIST")
        .unwrap_or_else(|_| "RELIANCE,TCS,INFY".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
