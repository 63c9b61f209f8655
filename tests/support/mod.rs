//! Shared mock collaborators and builders for the integration tests.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use nonempty::NonEmpty;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use stocksage::engine::error::{DecisionError, FetchError};
use stocksage::engine::sources::{DecisionSource, MarketDataSource};
use stocksage::engine::types::{
    DayForecast, DecisionContext, IndicatorSet, MarketSummary, TradeAction, TradeSignal,
    WeeklyForecast,
};
use stocksage::{InstrumentKey, OhlcvBar};

/// Daily bars with the given closes, one bar per calendar day from `start`.
pub fn daily_bars(start: NaiveDate, closes: &[f64]) -> Vec<OhlcvBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| OhlcvBar {
            date: start + Days::new(i as u64),
            open: close - 1.0,
            high: close + 5.0,
            low: close - 5.0,
            close,
            volume: 500_000,
        })
        .collect()
}

/// A gently rising series of `n` bars ending at `last_close`.
pub fn rising_bars(n: usize, last_close: f64) -> Vec<OhlcvBar> {
    let start = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
    let closes: Vec<f64> = (0..n)
        .map(|i| last_close - (n - 1 - i) as f64)
        .collect();
    daily_bars(start, &closes)
}

/// Scriptable market data source with call counting and optional latency.
pub struct MockMarket {
    default_response: Mutex<Result<Vec<OhlcvBar>, FetchError>>,
    per_symbol: Mutex<HashMap<String, Vec<OhlcvBar>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockMarket {
    pub fn with_bars(bars: Vec<OhlcvBar>) -> Self {
        Self {
            default_response: Mutex::new(Ok(bars)),
            per_symbol: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: FetchError) -> Self {
        Self {
            default_response: Mutex::new(Err(err)),
            per_symbol: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the series served for one normalized symbol.
    pub fn with_symbol_bars(self, symbol: &str, bars: Vec<OhlcvBar>) -> Self {
        self.per_symbol
            .lock()
            .unwrap()
            .insert(symbol.to_string(), bars);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for MockMarket {
    async fn fetch(&self, key: &InstrumentKey) -> Result<Vec<OhlcvBar>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(bars) = self.per_symbol.lock().unwrap().get(&key.symbol) {
            return Ok(bars.clone());
        }
        self.default_response.lock().unwrap().clone()
    }
}

/// Scriptable decision source with independent decide/forecast counters.
pub struct MockDecision {
    signal: Mutex<Result<TradeSignal, DecisionError>>,
    forecast: Mutex<Result<WeeklyForecast, DecisionError>>,
    decide_calls: AtomicUsize,
    forecast_calls: AtomicUsize,
}

impl MockDecision {
    pub fn with_signal(signal: TradeSignal) -> Self {
        Self {
            signal: Mutex::new(Ok(signal)),
            forecast: Mutex::new(Err(DecisionError::Provider(
                "no forecast configured".to_string(),
            ))),
            decide_calls: AtomicUsize::new(0),
            forecast_calls: AtomicUsize::new(0),
        }
    }

    pub fn buying() -> Self {
        Self::with_signal(TradeSignal {
            action: TradeAction::Buy,
            confidence: "High".to_string(),
            technical_summary: Some("momentum bullish".to_string()),
            fundamental_summary: Some("not applicable".to_string()),
            sentiment_summary: Some("buzz positive".to_string()),
            final_summary: Some("buy the trend".to_string()),
        })
    }

    pub fn failing(err: DecisionError) -> Self {
        Self {
            signal: Mutex::new(Err(err)),
            forecast: Mutex::new(Err(DecisionError::Provider(
                "no forecast configured".to_string(),
            ))),
            decide_calls: AtomicUsize::new(0),
            forecast_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_forecast(self, forecast: WeeklyForecast) -> Self {
        *self.forecast.lock().unwrap() = Ok(forecast);
        self
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn forecast_calls(&self) -> usize {
        self.forecast_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionSource for MockDecision {
    async fn decide(
        &self,
        _key: &InstrumentKey,
        _bars: &[OhlcvBar],
        _indicators: &IndicatorSet,
        _context: &DecisionContext,
    ) -> Result<TradeSignal, DecisionError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        self.signal.lock().unwrap().clone()
    }

    async fn forecast_week(
        &self,
        _key: &InstrumentKey,
        _summary: &MarketSummary,
        _week_start: NaiveDate,
        _week_end: NaiveDate,
    ) -> Result<WeeklyForecast, DecisionError> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        self.forecast.lock().unwrap().clone()
    }
}

/// Five-day Monday-to-Friday forecast around `base`.
pub fn flat_forecast(base: f64) -> WeeklyForecast {
    let days = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];
    WeeklyForecast {
        reasoning: "range-bound week expected".to_string(),
        daily: NonEmpty::from_vec(
            days.iter()
                .map(|day| DayForecast {
                    day: day.to_string(),
                    predicted_close: base,
                })
                .collect(),
        )
        .unwrap(),
    }
}
