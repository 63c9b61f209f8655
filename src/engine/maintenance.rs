//! Retention sweeps for cached data and decision history.
//!
//! Retention is a policy independent of the freshness TTL: a stale entry
//! stays available for the degraded fallback path until the sweep removes it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::engine::error::StoreError;
use crate::engine::store::AnalysisStore;

/// Rows removed by one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    pub cache_rows: u64,
    pub decision_rows: u64,
}

/// Internal timer deleting cache entries and decisions past their retention
/// horizons.
pub struct RetentionSweeper {
    store: Arc<dyn AnalysisStore>,
    interval: Duration,
    cache_retention: Duration,
    decision_retention: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        interval: Duration,
        cache_retention: Duration,
        decision_retention: Duration,
    ) -> Self {
        Self {
            store,
            interval,
            cache_retention,
            decision_retention,
        }
    }

    pub async fn run(self) {
        info!(
            "RetentionSweeper running; sweep every {} minutes",
            self.interval.as_secs() / 60
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            match self.sweep_once().await {
                Ok(stats) if stats.cache_rows + stats.decision_rows > 0 => info!(
                    cache_rows = stats.cache_rows,
                    decision_rows = stats.decision_rows,
                    "retention sweep removed expired rows"
                ),
                Ok(_) => {}
                Err(e) => error!("retention sweep failed: {e}"),
            }
        }
    }

    /// One sweep pass. Public for tests and operational tooling.
    pub async fn sweep_once(&self) -> Result<SweepStats, StoreError> {
        let now = Utc::now();
        // An out-of-range retention clamps to a horizon that removes nothing.
        let clamp = |d: Duration| {
            chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
        };
        let cache_horizon = now - clamp(self.cache_retention);
        let decision_horizon = now - clamp(self.decision_retention);

        Ok(SweepStats {
            cache_rows: self.store.sweep_cache_older_than(cache_horizon).await?,
            decision_rows: self
                .store
                .sweep_decisions_older_than(decision_horizon)
                .await?,
        })
    }
}
