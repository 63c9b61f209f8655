//! Domain types for the analysis engine: indicator payloads, decisions,
//! cache entries and weekly index predictions.

use chrono::{DateTime, NaiveDate, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::engine::error::{AnalysisError, DecisionError};
use crate::types::{InstrumentKey, OhlcvBar};

/// Look-back windows for the indicator engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub sma_short: usize,
    pub sma_long: usize,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            sma_short: 20,
            sma_long: 50,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
        }
    }
}

/// MACD line, signal line and histogram at the latest bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Computed indicators for one instrument. A `None` field means the series
/// was shorter than that indicator's look-back window; it is not an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<MacdOutput>,
}

/// The closed set of decision values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "HOLD")]
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }

    /// Parse a provider-supplied decision value. Validation happens at the
    /// DecisionSource boundary; anything outside the closed set is rejected.
    pub fn parse(raw: &str) -> Result<Self, DecisionError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            "HOLD" => Ok(TradeAction::Hold),
            other => Err(DecisionError::InvalidResponse(format!(
                "decision {other:?} is not one of BUY/SELL/HOLD"
            ))),
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured decision produced by the DecisionSource, validated at the
/// boundary. Rationale sections are free text and individually optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub action: TradeAction,
    pub confidence: String,
    pub technical_summary: Option<String>,
    pub fundamental_summary: Option<String>,
    pub sentiment_summary: Option<String>,
    pub final_summary: Option<String>,
}

/// One persisted decision row. `price_at_decision` is immutable once
/// written; `profit_loss` is back-filled at most once when the review job
/// observes a realized outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub key: InstrumentKey,
    pub signal: TradeSignal,
    pub price_at_decision: f64,
    pub timestamp: DateTime<Utc>,
    pub profit_loss: Option<f64>,
}

/// Cached market data and indicators for one instrument key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: InstrumentKey,
    pub bars: Vec<OhlcvBar>,
    pub indicators: IndicatorSet,
    pub last_updated: DateTime<Utc>,
}

impl CachedEntry {
    /// Freshness check against an explicit clock. Pure, no I/O.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::max_value());
        now.signed_duration_since(self.last_updated) < ttl
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.is_fresh_at(Utc::now(), ttl)
    }

    /// Close of the most recent bar, if any.
    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|bar| bar.close)
    }
}

/// Predicted close for one trading day of the forecast week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayForecast {
    pub day: String,
    pub predicted_close: f64,
}

/// Day-wise weekly forecast returned by the DecisionSource. The day list is
/// structurally non-empty; an empty forecast is rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyForecast {
    pub reasoning: String,
    pub daily: NonEmpty<DayForecast>,
}

/// Reconciliation state of a weekly prediction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RECONCILED")]
    Reconciled,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "PENDING",
            PredictionStatus::Reconciled => "RECONCILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AnalysisError> {
        match raw {
            "PENDING" => Ok(PredictionStatus::Pending),
            "RECONCILED" => Ok(PredictionStatus::Reconciled),
            other => Err(AnalysisError::Persistence(format!(
                "unknown prediction status: {other}"
            ))),
        }
    }
}

/// One weekly index prediction row. The day-wise forecast is immutable once
/// written; only the actual-outcome fields are back-filled, exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPrediction {
    pub id: i64,
    pub symbol: String,
    pub prediction_date: NaiveDate,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub forecast: WeeklyForecast,
    pub actual_close: Option<f64>,
    pub performance_summary: Option<String>,
    pub status: PredictionStatus,
}

/// Year-scale history summary fed to the weekly forecast prompt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketSummary {
    pub current_price: f64,
    pub year_high: f64,
    pub year_low: f64,
    pub fifty_day_avg: f64,
    pub two_hundred_day_avg: f64,
}

/// Extra context handed to the DecisionSource alongside data and indicators.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    /// Summary of the engine's own recent closed calls for this instrument.
    pub past_performance: Option<String>,
}

/// Who is asking: interactive requests fail loudly by default, scheduled
/// ones may accept a stale fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Interactive,
    Scheduled,
}

/// Engine-wide tunables. Constructed once at process start and shared.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Freshness TTL for cache entries.
    pub cache_ttl: Duration,
    /// Retention horizon for cache rows, independent of the freshness TTL.
    pub cache_retention: Duration,
    /// Retention horizon for decision rows.
    pub decision_retention: Duration,
    /// How often the retention sweeper wakes up.
    pub sweep_interval: Duration,
    /// Serve a stale entry to interactive callers when a refresh fails.
    pub interactive_stale_fallback: bool,
    /// Serve a stale entry to scheduled callers when a refresh fails.
    pub scheduled_stale_fallback: bool,
    /// How many recent closed decisions feed the past-performance context.
    pub past_performance_window: usize,
    pub indicator_params: IndicatorParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60 * 60),
            cache_retention: Duration::from_secs(24 * 60 * 60),
            decision_retention: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            interactive_stale_fallback: false,
            scheduled_stale_fallback: true,
            past_performance_window: 3,
            indicator_params: IndicatorParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn allows_stale_fallback(&self, mode: RequestMode) -> bool {
        match mode {
            RequestMode::Interactive => self.interactive_stale_fallback,
            RequestMode::Scheduled => self.scheduled_stale_fallback,
        }
    }
}

/// Payload returned to the API layer for one analysis request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub key: InstrumentKey,
    pub bars: Vec<OhlcvBar>,
    pub indicators: IndicatorSet,
    pub last_updated: DateTime<Utc>,
    /// Persisted decision, when decisioning succeeded (or a prior decision
    /// on the cache-hit path).
    pub decision: Option<DecisionRecord>,
    /// Set when data was refreshed but decisioning failed; the fresh data is
    /// still cached and returned.
    pub decision_error: Option<DecisionError>,
    /// True when the payload was served from cache without a provider call.
    pub cached: bool,
    /// True only on the degraded stale-fallback path.
    pub stale: bool,
}

/// Aggregated track record over closed BUY/SELL decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: i64,
    pub win_rate_percent: f64,
    pub average_pnl_percent: f64,
    pub best_trade: Option<TradeOutcome>,
    pub worst_trade: Option<TradeOutcome>,
}

/// One realized trade referenced by the performance summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub action: TradeAction,
    pub profit_loss: f64,
    pub timestamp: DateTime<Utc>,
}
