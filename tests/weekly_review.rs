//! Integration tests for the weekly review job: reconciliation idempotence,
//! P&L back-fill semantics and forecast generation.

mod support;

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

use stocksage::engine::types::{EngineConfig, TradeAction, TradeSignal};
use stocksage::engine::{AnalysisStore, SqliteStore, WeeklyReviewConfig, WeeklyReviewScheduler};
use stocksage::{Exchange, InstrumentKey};

use support::{daily_bars, flat_forecast, rising_bars, MockDecision, MockMarket};

fn review_config(indices: Vec<String>) -> WeeklyReviewConfig {
    WeeklyReviewConfig {
        indices,
        check_interval: Duration::from_secs(3600),
    }
}

fn signal(action: TradeAction) -> TradeSignal {
    TradeSignal {
        action,
        confidence: "Medium".to_string(),
        technical_summary: None,
        fundamental_summary: None,
        sentiment_summary: None,
        final_summary: None,
    }
}

async fn store() -> Arc<SqliteStore> {
    SqliteStore::in_memory(EngineConfig::default().cache_ttl)
        .await
        .unwrap()
}

#[tokio::test]
async fn reconciliation_runs_exactly_once_per_week() {
    let store = store().await;
    // A past week: Monday 2025-06-02 through Friday 2025-06-06.
    let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
    store
        .insert_prediction(
            "^NSEI",
            week_start - chrono::Days::new(3),
            week_start,
            week_start + chrono::Days::new(4),
            &flat_forecast(25_000.0),
        )
        .await
        .unwrap();

    let market = Arc::new(MockMarket::with_bars(daily_bars(
        week_start,
        &[25_100.0, 25_150.0, 25_200.0, 25_150.0, 25_250.0],
    )));
    let decisions = Arc::new(MockDecision::buying());
    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market.clone(),
        decisions.clone(),
        review_config(vec![]),
    );

    let first = scheduler.run_once().await.unwrap();
    assert_eq!(first.reconciled, 1);
    assert_eq!(market.calls(), 1);
    assert!(store
        .pending_predictions_ended_by(Utc::now().date_naive())
        .await
        .unwrap()
        .is_empty());

    // Second pass: nothing pending, no fetch, no state change.
    let second = scheduler.run_once().await.unwrap();
    assert_eq!(second.reconciled, 0);
    assert_eq!(market.calls(), 1);
}

#[tokio::test]
async fn fetch_failure_leaves_prediction_pending_for_retry() {
    let store = store().await;
    let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
    store
        .insert_prediction(
            "^NSEI",
            week_start,
            week_start,
            week_start + chrono::Days::new(4),
            &flat_forecast(25_000.0),
        )
        .await
        .unwrap();

    let market = Arc::new(MockMarket::failing(
        stocksage::engine::error::FetchError::Unavailable("provider down".to_string()),
    ));
    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market,
        Arc::new(MockDecision::buying()),
        review_config(vec![]),
    );

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.reconciled, 0);

    let pending = store
        .pending_predictions_ended_by(Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn pnl_backfill_applies_sign_convention_and_holiday_skip() {
    let store = store().await;
    let now = Utc::now();

    let reliance = InstrumentKey::new("RELIANCE", Exchange::Nse).unwrap();
    let tcs = InstrumentKey::new("TCS", Exchange::Nse).unwrap();
    let infy = InstrumentKey::new("INFY", Exchange::Nse).unwrap();

    let buy = store
        .insert_decision(&reliance, &signal(TradeAction::Buy), 100.0, now)
        .await
        .unwrap();
    let sell = store
        .insert_decision(&tcs, &signal(TradeAction::Sell), 200.0, now)
        .await
        .unwrap();
    let holiday = store
        .insert_decision(&infy, &signal(TradeAction::Buy), 1_500.0, now)
        .await
        .unwrap();
    // HOLD rows never get a P&L.
    store
        .insert_decision(
            &reliance,
            &signal(TradeAction::Hold),
            100.0,
            now + chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    let market = Arc::new(
        MockMarket::with_bars(rising_bars(5, 1.0))
            .with_symbol_bars("RELIANCE.NS", rising_bars(5, 110.0))
            .with_symbol_bars("TCS.NS", rising_bars(5, 180.0))
            .with_symbol_bars("INFY.NS", rising_bars(5, 1_500.0)),
    );
    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market,
        Arc::new(MockDecision::buying()),
        review_config(vec![]),
    );

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.pnl_backfilled, 2);

    // BUY: (110 - 100) / 100 = +10%. SELL: (180 - 200) / 200 = -10%,
    // negated to +10% because the call was to exit.
    let buy_row = store
        .decision_history(&reliance, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.id == buy.id)
        .unwrap();
    assert!((buy_row.profit_loss.unwrap() - 10.0).abs() < 1e-9);

    let sell_row = store.latest_decision(&tcs).await.unwrap().unwrap();
    assert_eq!(sell_row.id, sell.id);
    assert!((sell_row.profit_loss.unwrap() - 10.0).abs() < 1e-9);

    // Unchanged price reads as a holiday: left for a later pass.
    let holiday_row = store.latest_decision(&infy).await.unwrap().unwrap();
    assert_eq!(holiday_row.id, holiday.id);
    assert!(holiday_row.profit_loss.is_none());

    // The already-realized rows are not touched again.
    let second = scheduler.run_once().await.unwrap();
    assert_eq!(second.pnl_backfilled, 0);
}

#[tokio::test]
async fn forecast_generation_skips_weeks_that_already_exist() {
    let store = store().await;
    let market = Arc::new(MockMarket::with_bars(rising_bars(250, 25_400.0)));
    let decisions = Arc::new(MockDecision::buying().with_forecast(flat_forecast(25_500.0)));
    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market,
        decisions.clone(),
        review_config(vec!["^NSEI".to_string()]),
    );

    let first = scheduler.run_once().await.unwrap();
    assert_eq!(first.forecasts_generated, 1);
    assert_eq!(decisions.forecast_calls(), 1);

    // The upcoming week already has a row: no new forecast, no new call.
    let second = scheduler.run_once().await.unwrap();
    assert_eq!(second.forecasts_generated, 0);
    assert_eq!(decisions.forecast_calls(), 1);
}

#[tokio::test]
async fn forecast_provider_failure_is_skipped_not_fatal() {
    let store = store().await;
    let market = Arc::new(MockMarket::with_bars(rising_bars(250, 25_400.0)));
    // Decide works, forecast does not.
    let decisions = Arc::new(MockDecision::buying());
    let scheduler = WeeklyReviewScheduler::new(
        store.clone(),
        market,
        decisions.clone(),
        review_config(vec!["^NSEI".to_string()]),
    );

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.forecasts_generated, 0);
    assert_eq!(decisions.forecast_calls(), 1);

    // Nothing was inserted, so the next pass tries again.
    let second = scheduler.run_once().await.unwrap();
    assert_eq!(second.forecasts_generated, 0);
    assert_eq!(decisions.forecast_calls(), 2);
}
