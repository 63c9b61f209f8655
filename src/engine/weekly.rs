//! Calendar-cadence review job: reconciles weekly index predictions against
//! realized closes, back-fills decision P&L, and seeds forecasts for the
//! upcoming week.
//!
//! Same idempotence discipline as the request path: every reconciliation is
//! guarded by the persisted `PENDING -> RECONCILED` transition, so a week is
//! evaluated exactly once no matter how often the job runs. A failed fetch
//! leaves the record `PENDING` for the next scheduled pass.

use chrono::{Datelike, Days, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::engine::error::AnalysisError;
use crate::engine::sources::{DecisionSource, MarketDataSource};
use crate::engine::store::AnalysisStore;
use crate::engine::types::{MarketSummary, TradeAction, WeeklyPrediction};
use crate::types::{Exchange, InstrumentKey, OhlcvBar};

/// Tunables for the weekly review job.
#[derive(Debug, Clone)]
pub struct WeeklyReviewConfig {
    /// Index symbols to predict each week.
    pub indices: Vec<String>,
    /// How often the job wakes up.
    pub check_interval: Duration,
}

impl Default for WeeklyReviewConfig {
    fn default() -> Self {
        Self {
            indices: vec!["^NSEI".to_string(), "^BSESN".to_string()],
            check_interval: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// What one review pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReviewReport {
    pub reconciled: usize,
    pub pnl_backfilled: usize,
    pub forecasts_generated: usize,
}

/// Periodic reconciliation job. Runs independently of request traffic and
/// shares no state with the coordinator beyond the store.
pub struct WeeklyReviewScheduler {
    store: Arc<dyn AnalysisStore>,
    market: Arc<dyn MarketDataSource>,
    decisions: Arc<dyn DecisionSource>,
    config: WeeklyReviewConfig,
}

impl WeeklyReviewScheduler {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        market: Arc<dyn MarketDataSource>,
        decisions: Arc<dyn DecisionSource>,
        config: WeeklyReviewConfig,
    ) -> Self {
        Self {
            store,
            market,
            decisions,
            config,
        }
    }

    /// Main loop. Per-item provider failures are logged and retried on the
    /// next pass; only storage failures abort a pass.
    pub async fn run(self) {
        info!(
            "WeeklyReviewScheduler running; review every {} minutes",
            self.config.check_interval.as_secs() / 60
        );
        let mut interval = tokio::time::interval(self.config.check_interval);

        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(report) => info!(
                    reconciled = report.reconciled,
                    pnl_backfilled = report.pnl_backfilled,
                    forecasts = report.forecasts_generated,
                    "weekly review pass complete"
                ),
                Err(e) => error!("weekly review pass failed: {e}"),
            }
        }
    }

    /// One full pass: reconcile, back-fill, generate. Public for tests and
    /// for one-shot invocation from operational tooling.
    pub async fn run_once(&self) -> Result<ReviewReport, AnalysisError> {
        Ok(ReviewReport {
            reconciled: self.reconcile_pending().await?,
            pnl_backfilled: self.backfill_profit_loss().await?,
            forecasts_generated: self.generate_forecasts().await?,
        })
    }

    async fn reconcile_pending(&self) -> Result<usize, AnalysisError> {
        let today = Utc::now().date_naive();
        let pending = self.store.pending_predictions_ended_by(today).await?;
        let mut reconciled = 0;

        for prediction in pending {
            let key = match InstrumentKey::new(&prediction.symbol, Exchange::Nse) {
                Ok(key) => key,
                Err(e) => {
                    warn!(symbol = %prediction.symbol, error = %e, "unusable prediction symbol");
                    continue;
                }
            };
            let bars = match self.market.fetch(&key).await {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(%key, error = %e, "actuals unavailable, leaving prediction pending");
                    continue;
                }
            };
            let Some((actual_close, summary)) = evaluate_prediction(&prediction, &bars) else {
                warn!(%key, week_start = %prediction.week_start,
                      "no bars inside prediction week, leaving pending");
                continue;
            };
            if self
                .store
                .reconcile_prediction(prediction.id, actual_close, &summary)
                .await?
            {
                info!(%key, week_start = %prediction.week_start, summary = %summary,
                      "prediction reconciled");
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn backfill_profit_loss(&self) -> Result<usize, AnalysisError> {
        let open = self.store.unrealized_decisions().await?;
        if open.is_empty() {
            debug!("no decisions awaiting P&L");
            return Ok(0);
        }

        // One provider call per distinct instrument.
        let mut latest_close: HashMap<InstrumentKey, f64> = HashMap::new();
        for decision in &open {
            if latest_close.contains_key(&decision.key) {
                continue;
            }
            match self.market.fetch(&decision.key).await {
                Ok(bars) => {
                    if let Some(last) = bars.last() {
                        latest_close.insert(decision.key.clone(), last.close);
                    }
                }
                Err(e) => warn!(key = %decision.key, error = %e, "no current price for P&L"),
            }
        }

        let mut updated = 0;
        for decision in open {
            let Some(&current) = latest_close.get(&decision.key) else {
                continue;
            };
            if decision.price_at_decision <= 0.0 {
                continue;
            }
            // An unchanged price usually means a market holiday; wait for
            // the next pass instead of recording a zero outcome.
            if (current - decision.price_at_decision).abs() < 0.01 {
                debug!(key = %decision.key, "price unchanged, skipping P&L");
                continue;
            }

            let mut pnl =
                (current - decision.price_at_decision) / decision.price_at_decision * 100.0;
            if decision.signal.action == TradeAction::Sell {
                pnl = -pnl;
            }
            if self.store.set_profit_loss(decision.id, pnl).await? {
                info!(key = %decision.key, id = decision.id, pnl = %format!("{pnl:.2}%"),
                      "P&L back-filled");
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn generate_forecasts(&self) -> Result<usize, AnalysisError> {
        let today = Utc::now().date_naive();
        let week_start = upcoming_week_start(today);
        let week_end = week_start + Days::new(4);
        let mut generated = 0;

        for symbol in &self.config.indices {
            let key = match InstrumentKey::new(symbol, Exchange::Nse) {
                Ok(key) => key,
                Err(e) => {
                    warn!(%symbol, error = %e, "unusable index symbol");
                    continue;
                }
            };
            if self.store.prediction_exists(&key.symbol, week_start).await? {
                debug!(%key, %week_start, "forecast already exists, skipping");
                continue;
            }

            let bars = match self.market.fetch_year(&key).await {
                Ok(bars) if !bars.is_empty() => bars,
                Ok(_) => {
                    warn!(%key, "empty history, skipping forecast");
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "history unavailable, skipping forecast");
                    continue;
                }
            };
            let summary = market_summary(&bars);

            match self
                .decisions
                .forecast_week(&key, &summary, week_start, week_end)
                .await
            {
                Ok(forecast) => {
                    self.store
                        .insert_prediction(&key.symbol, today, week_start, week_end, &forecast)
                        .await?;
                    info!(%key, %week_start, "weekly forecast generated");
                    generated += 1;
                }
                Err(e) => warn!(%key, error = %e, "forecast generation failed"),
            }
        }
        Ok(generated)
    }
}

/// Monday of the upcoming week; today when today already is that Monday.
fn upcoming_week_start(today: NaiveDate) -> NaiveDate {
    let days_ahead = (7 - today.weekday().num_days_from_monday()) % 7;
    today + Days::new(days_ahead as u64)
}

/// Compare a day-wise forecast against actual bars. Returns the final close
/// of the week and the performance summary, or `None` when no bar fell
/// inside the prediction week.
fn evaluate_prediction(
    prediction: &WeeklyPrediction,
    bars: &[OhlcvBar],
) -> Option<(f64, String)> {
    let week_bars: Vec<&OhlcvBar> = bars
        .iter()
        .filter(|b| b.date >= prediction.week_start && b.date <= prediction.week_end)
        .collect();
    let final_close = week_bars.last()?.close;

    let mut lines = Vec::new();
    let mut total_diff = 0.0;
    let mut counted = 0usize;

    for (i, day) in prediction.forecast.daily.iter().enumerate() {
        let date = prediction.week_start + Days::new(i as u64);
        let Some(bar) = week_bars.iter().find(|b| b.date == date) else {
            continue;
        };
        if day.predicted_close <= 0.0 {
            continue;
        }
        let diff = (bar.close - day.predicted_close) / day.predicted_close * 100.0;
        lines.push(format!("- {}: off by {:.2}%", day.day, diff));
        total_diff += diff;
        counted += 1;
    }

    let avg = if counted > 0 {
        total_diff / counted as f64
    } else {
        0.0
    };
    Some((
        final_close,
        format!("Avg Daily Error: {:.2}%. {}", avg, lines.join(" ")),
    ))
}

/// Year-scale summary for the forecast prompt.
fn market_summary(bars: &[OhlcvBar]) -> MarketSummary {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let tail_avg = |n: usize| {
        let window = &closes[closes.len().saturating_sub(n)..];
        window.iter().sum::<f64>() / window.len() as f64
    };

    MarketSummary {
        current_price: closes.last().copied().unwrap_or(0.0),
        year_high: bars.iter().map(|b| b.high).fold(f64::MIN, f64::max),
        year_low: bars.iter().map(|b| b.low).fold(f64::MAX, f64::min),
        fifty_day_avg: tail_avg(50),
        two_hundred_day_avg: tail_avg(200),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{DayForecast, PredictionStatus, WeeklyForecast};
    use nonempty::NonEmpty;

    fn bar(date: NaiveDate, close: f64) -> OhlcvBar {
        OhlcvBar {
            date,
            open: close,
            high: close + 10.0,
            low: close - 10.0,
            close,
            volume: 1_000_000,
        }
    }

    fn prediction(week_start: NaiveDate, predicted: &[f64]) -> WeeklyPrediction {
        let days = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];
        let daily: Vec<DayForecast> = predicted
            .iter()
            .zip(days)
            .map(|(&p, day)| DayForecast {
                day: day.to_string(),
                predicted_close: p,
            })
            .collect();
        WeeklyPrediction {
            id: 1,
            symbol: "^NSEI".to_string(),
            prediction_date: week_start - Days::new(2),
            week_start,
            week_end: week_start + Days::new(4),
            forecast: WeeklyForecast {
                reasoning: "test".to_string(),
                daily: NonEmpty::from_vec(daily).unwrap(),
            },
            actual_close: None,
            performance_summary: None,
            status: PredictionStatus::Pending,
        }
    }

    #[test]
    fn week_start_rolls_to_next_monday() {
        // 2025-06-04 is a Wednesday.
        let wednesday = NaiveDate::from_ymd_opt(2025, 6, 4).unwrap();
        assert_eq!(
            upcoming_week_start(wednesday),
            NaiveDate::from_ymd_opt(2025, 6, 9).unwrap()
        );
        // A Monday maps to itself.
        let monday = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        assert_eq!(upcoming_week_start(monday), monday);
    }

    #[test]
    fn evaluation_matches_days_to_dates() {
        let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let prediction = prediction(week_start, &[25_000.0, 25_100.0]);
        // Tuesday is missing from the actuals (holiday).
        let bars = vec![
            bar(week_start - Days::new(3), 24_000.0),
            bar(week_start, 25_250.0),
            bar(week_start + Days::new(2), 25_400.0),
        ];

        let (actual_close, summary) = evaluate_prediction(&prediction, &bars).unwrap();
        assert_eq!(actual_close, 25_400.0);
        assert!(summary.starts_with("Avg Daily Error: 1.00%."));
        assert!(summary.contains("Monday"));
        assert!(!summary.contains("Tuesday"));
    }

    #[test]
    fn evaluation_without_week_bars_is_none() {
        let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let prediction = prediction(week_start, &[25_000.0]);
        let bars = vec![bar(week_start - Days::new(7), 24_000.0)];
        assert!(evaluate_prediction(&prediction, &bars).is_none());
    }

    #[test]
    fn market_summary_uses_tail_windows() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let bars: Vec<OhlcvBar> = (0..250)
            .map(|i| bar(start + Days::new(i), 100.0 + i as f64))
            .collect();

        let summary = market_summary(&bars);
        assert_eq!(summary.current_price, 349.0);
        assert_eq!(summary.year_high, 359.0);
        assert_eq!(summary.year_low, 90.0);
        // Mean of 300..=349 and of 150..=349.
        assert!((summary.fifty_day_avg - 324.5).abs() < 1e-9);
        assert!((summary.two_hundred_day_avg - 249.5).abs() < 1e-9);
    }
}
