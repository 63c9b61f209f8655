//! The fetch coordinator: cache-first analysis with per-key singleflight.
//!
//! For any (symbol, exchange) key at most one external refresh is in flight
//! at a time. Concurrent requesters for the same stale or missing key join
//! the existing flight and all observe the same outcome, success or the
//! same failure, never a mixture. The flight runs on a detached task, so a
//! caller abandoning its wait never cancels work other waiters depend on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::engine::error::{AnalysisError, DecisionError, FetchError};
use crate::engine::indicators;
use crate::engine::sources::{DecisionSource, MarketDataSource};
use crate::engine::store::AnalysisStore;
use crate::engine::types::{
    Analysis, CachedEntry, DecisionContext, DecisionRecord, EngineConfig, PerformanceSummary,
    RequestMode,
};
use crate::types::{Exchange, InstrumentKey};

/// Everything one completed flight produces.
#[derive(Debug, Clone)]
struct FlightOutcome {
    entry: CachedEntry,
    decision: Option<DecisionRecord>,
    decision_error: Option<DecisionError>,
}

type FlightResult = Result<FlightOutcome, AnalysisError>;
type InflightMap = HashMap<InstrumentKey, watch::Receiver<Option<FlightResult>>>;

/// Orchestrates cache lookups, singleflight refreshes and persistence.
///
/// Owns no entries itself: the injected store is the single point of
/// synchronization for persisted state, the in-flight registry only tracks
/// live refreshes.
pub struct FetchCoordinator {
    store: Arc<dyn AnalysisStore>,
    market: Arc<dyn MarketDataSource>,
    decisions: Arc<dyn DecisionSource>,
    config: EngineConfig,
    inflight: Arc<Mutex<InflightMap>>,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        market: Arc<dyn MarketDataSource>,
        decisions: Arc<dyn DecisionSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            market,
            decisions,
            config,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Analyze one instrument: fresh cache hits return immediately with no
    /// provider calls; everything else goes through the singleflight path.
    #[instrument(skip(self), fields(symbol = %symbol, exchange = %exchange))]
    pub async fn analyze(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: RequestMode,
    ) -> Result<Analysis, AnalysisError> {
        let key = InstrumentKey::new(symbol, exchange)?;

        if let Some(entry) = self.store.get_cached(&key).await? {
            if entry.is_fresh(self.config.cache_ttl) {
                debug!(%key, "fresh cache hit");
                let decision = self.store.latest_decision(&key).await?;
                return Ok(self.respond(entry, decision, None, true, false));
            }
        }

        match self.join_flight(&key).await {
            Ok(outcome) => Ok(self.respond(
                outcome.entry,
                outcome.decision,
                outcome.decision_error,
                false,
                false,
            )),
            Err(err) => self.stale_fallback(&key, mode, err).await,
        }
    }

    /// The raw cache entry for a key, fresh or stale, without triggering a
    /// refresh.
    pub async fn cached(
        &self,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Option<CachedEntry>, AnalysisError> {
        let key = InstrumentKey::new(symbol, exchange)?;
        Ok(self.store.get_cached(&key).await?)
    }

    /// Past decisions for a key, newest first.
    pub async fn history(
        &self,
        symbol: &str,
        exchange: Exchange,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, AnalysisError> {
        let key = InstrumentKey::new(symbol, exchange)?;
        Ok(self.store.decision_history(&key, limit).await?)
    }

    /// Aggregate track record over closed trades.
    pub async fn performance_summary(&self) -> Result<PerformanceSummary, AnalysisError> {
        Ok(self.store.performance_summary().await?)
    }

    fn respond(
        &self,
        entry: CachedEntry,
        decision: Option<DecisionRecord>,
        decision_error: Option<DecisionError>,
        cached: bool,
        stale: bool,
    ) -> Analysis {
        Analysis {
            key: entry.key.clone(),
            bars: entry.bars,
            indicators: entry.indicators,
            last_updated: entry.last_updated,
            decision,
            decision_error,
            cached,
            stale,
        }
    }

    /// Serve the prior stale entry, explicitly flagged, when the caller's
    /// policy allows; otherwise propagate the refresh failure.
    async fn stale_fallback(
        &self,
        key: &InstrumentKey,
        mode: RequestMode,
        err: AnalysisError,
    ) -> Result<Analysis, AnalysisError> {
        if !self.config.allows_stale_fallback(mode) {
            return Err(err);
        }
        match self.store.get_cached(key).await? {
            Some(entry) => {
                warn!(%key, error = %err, "refresh failed, serving stale entry");
                let decision = self.store.latest_decision(key).await?;
                Ok(self.respond(entry, decision, None, true, true))
            }
            None => Err(err),
        }
    }

    /// Become the leader for `key` or join the leader already in flight.
    async fn join_flight(&self, key: &InstrumentKey) -> FlightResult {
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(rx) => {
                    debug!(%key, "joining in-flight refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx.clone());

                    let store = Arc::clone(&self.store);
                    let market = Arc::clone(&self.market);
                    let decisions = Arc::clone(&self.decisions);
                    let config = self.config.clone();
                    let registry = Arc::clone(&self.inflight);
                    let flight_key = key.clone();

                    // Detached: the refresh outlives any individual caller.
                    tokio::spawn(async move {
                        let result =
                            run_flight(store, market, decisions, config, flight_key.clone()).await;
                        registry.lock().await.remove(&flight_key);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        loop {
            let settled = rx.borrow_and_update().clone();
            if let Some(result) = settled {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(AnalysisError::DataFetch(FetchError::Unavailable(
                    "refresh task aborted".to_string(),
                )));
            }
        }
    }
}

/// One leader refresh: fetch, compute, cache, decide, persist.
///
/// A fetch failure leaves the existing cache entry untouched. A decisioning
/// failure after a successful fetch still caches the fresh data and
/// indicators; no decision row is written and the failure rides along in the
/// outcome.
async fn run_flight(
    store: Arc<dyn AnalysisStore>,
    market: Arc<dyn MarketDataSource>,
    decisions: Arc<dyn DecisionSource>,
    config: EngineConfig,
    key: InstrumentKey,
) -> FlightResult {
    let bars = market.fetch(&key).await.map_err(AnalysisError::DataFetch)?;
    if bars.is_empty() {
        return Err(AnalysisError::DataFetch(FetchError::Unavailable(
            "provider returned an empty series".to_string(),
        )));
    }

    let indicators = indicators::compute(&bars, &config.indicator_params);
    let entry = CachedEntry {
        key: key.clone(),
        bars,
        indicators,
        last_updated: Utc::now(),
    };
    store.put_cached(&entry).await?;

    let context = DecisionContext {
        past_performance: past_performance(&*store, &key, config.past_performance_window).await?,
    };

    match decisions
        .decide(&key, &entry.bars, &entry.indicators, &context)
        .await
    {
        Ok(signal) => {
            // The series is non-empty, checked above.
            let price = entry.last_close().unwrap_or_default();
            let record = store
                .insert_decision(&key, &signal, price, Utc::now())
                .await?;
            info!(%key, action = %record.signal.action, "analysis completed");
            Ok(FlightOutcome {
                entry,
                decision: Some(record),
                decision_error: None,
            })
        }
        Err(err) => {
            warn!(%key, error = %err, "data refreshed but decisioning failed");
            Ok(FlightOutcome {
                entry,
                decision: None,
                decision_error: Some(err),
            })
        }
    }
}

/// Summarize the engine's own recent closed calls for the decision prompt.
async fn past_performance(
    store: &dyn AnalysisStore,
    key: &InstrumentKey,
    window: usize,
) -> Result<Option<String>, AnalysisError> {
    let closed = store.recent_closed_decisions(key, window as u32).await?;
    if closed.is_empty() {
        return Ok(None);
    }
    let avg = closed.iter().filter_map(|d| d.profit_loss).sum::<f64>() / closed.len() as f64;
    let calls: Vec<&str> = closed.iter().map(|d| d.signal.action.as_str()).collect();
    Ok(Some(format!(
        "Your last {} recommendations were [{}]. Average P&L: {:.2}%.",
        closed.len(),
        calls.join(", "),
        avg,
    )))
}
