//! External collaborators: market data and AI decisioning.
//!
//! The engine consumes both through narrow traits so the coordinator owns
//! fallback policy while the adapters own transport concerns (rate limiting,
//! transient-failure retries, payload validation).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonempty::NonEmpty;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{debug, instrument, warn};

use crate::engine::error::{DecisionError, FetchError};
use crate::engine::types::{
    DayForecast, DecisionContext, IndicatorSet, MarketSummary, TradeAction, TradeSignal,
    WeeklyForecast,
};
use crate::types::{InstrumentKey, OhlcvBar};

/// Supplier of raw daily OHLCV series for an instrument.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Daily series covering the default analysis window, oldest first.
    async fn fetch(&self, key: &InstrumentKey) -> Result<Vec<OhlcvBar>, FetchError>;

    /// Year-scale daily series for calendar jobs. Defaults to the analysis
    /// window when the provider has no cheaper long-range path.
    async fn fetch_year(&self, key: &InstrumentKey) -> Result<Vec<OhlcvBar>, FetchError> {
        self.fetch(key).await
    }
}

/// Supplier of structured AI decisions and weekly forecasts.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Produce a BUY/SELL/HOLD signal for fresh data and indicators.
    async fn decide(
        &self,
        key: &InstrumentKey,
        bars: &[OhlcvBar],
        indicators: &IndicatorSet,
        context: &DecisionContext,
    ) -> Result<TradeSignal, DecisionError>;

    /// Produce a day-wise forecast for the upcoming week of an index.
    async fn forecast_week(
        &self,
        key: &InstrumentKey,
        summary: &MarketSummary,
        week_start: NaiveDate,
        week_end: NaiveDate,
    ) -> Result<WeeklyForecast, DecisionError>;
}

/// Tunables for the chart-API market data adapter.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub base_url: String,
    /// Range for the analysis window (provider range syntax).
    pub range: String,
    pub requests_per_second: u32,
    pub retry_attempts: usize,
    pub request_timeout: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query1.finance.yahoo.com".to_string(),
            range: "6mo".to_string(),
            requests_per_second: 4,
            retry_attempts: 3,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartApiError>,
}

#[derive(Deserialize)]
struct ChartApiError {
    code: String,
    description: String,
}

#[derive(Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Deserialize)]
struct ChartIndicators {
    quote: Vec<ChartQuote>,
}

#[derive(Deserialize)]
struct ChartQuote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
}

/// Daily OHLCV from the public chart API.
///
/// A direct rate limiter gates every outbound call; transient transport
/// failures are retried with exponential backoff, while `NotFound` and
/// `RateLimited` surface immediately for the coordinator to classify.
pub struct YahooChartSource {
    http: Client,
    limiter: DefaultDirectRateLimiter,
    config: MarketDataConfig,
}

impl YahooChartSource {
    pub fn new(http: Client, config: MarketDataConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            http,
            limiter: RateLimiter::direct(quota),
            config,
        }
    }

    async fn fetch_range(&self, key: &InstrumentKey, range: &str) -> Result<Vec<OhlcvBar>, FetchError> {
        let retry = ExponentialBackoff::from_millis(250)
            .max_delay(Duration::from_secs(5))
            .take(self.config.retry_attempts);

        RetryIf::spawn(
            retry,
            || self.fetch_once(key, range),
            |err: &FetchError| matches!(err, FetchError::Unavailable(_)),
        )
        .await
    }

    async fn fetch_once(&self, key: &InstrumentKey, range: &str) -> Result<Vec<OhlcvBar>, FetchError> {
        self.limiter.until_ready().await;

        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval=1d",
            self.config.base_url,
            key.provider_symbol(),
            range,
        );

        let response = self
            .http
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchError::RateLimited),
            status if !status.is_success() => {
                return Err(FetchError::Unavailable(format!(
                    "provider returned HTTP {status}"
                )))
            }
            _ => {}
        }

        let payload: ChartResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Unavailable(format!("malformed chart payload: {e}")))?;

        if let Some(err) = payload.chart.error {
            if err.code.eq_ignore_ascii_case("not found") {
                return Err(FetchError::NotFound);
            }
            return Err(FetchError::Unavailable(format!(
                "{}: {}",
                err.code, err.description
            )));
        }

        let result = payload
            .chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or(FetchError::NotFound)?;

        let timestamps = result.timestamp.unwrap_or_default();
        let quote = result
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Unavailable("chart payload without quotes".to_string()))?;

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            // Holidays and halts come back as nulls; those days are dropped.
            let (open, high, low, close, volume) = match (
                quote.open.get(i).copied().flatten(),
                quote.high.get(i).copied().flatten(),
                quote.low.get(i).copied().flatten(),
                quote.close.get(i).copied().flatten(),
                quote.volume.get(i).copied().flatten(),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
                _ => continue,
            };
            let date = DateTime::<Utc>::from_timestamp(*ts, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| FetchError::Unavailable(format!("bad timestamp {ts}")))?;
            bars.push(OhlcvBar {
                date,
                open,
                high,
                low,
                close,
                volume,
            });
        }

        if bars.is_empty() {
            return Err(FetchError::Unavailable(
                "provider returned an empty series".to_string(),
            ));
        }

        debug!(%key, bars = bars.len(), "fetched daily series");
        Ok(bars)
    }
}

#[async_trait]
impl MarketDataSource for YahooChartSource {
    #[instrument(skip(self), fields(key = %key))]
    async fn fetch(&self, key: &InstrumentKey) -> Result<Vec<OhlcvBar>, FetchError> {
        let range = self.config.range.clone();
        self.fetch_range(key, &range).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn fetch_year(&self, key: &InstrumentKey) -> Result<Vec<OhlcvBar>, FetchError> {
        self.fetch_range(key, "1y").await
    }
}

/// Tunables for the chat-completions decision adapter.
#[derive(Debug, Clone)]
pub struct DecisionSourceConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl DecisionSourceConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key,
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawSignal {
    decision: String,
    confidence: Option<String>,
    technical_summary: Option<String>,
    fundamental_summary: Option<String>,
    sentiment_summary: Option<String>,
    final_summary: Option<String>,
}

#[derive(Deserialize)]
struct RawForecast {
    weekly_reasoning: String,
    daily_predictions: Vec<RawDayForecast>,
}

#[derive(Deserialize)]
struct RawDayForecast {
    day: String,
    predicted_price: f64,
}

/// Structured decisions from an OpenAI-style chat-completions API.
///
/// The model's reply is free text around a JSON object; the object is
/// extracted and validated here, at the boundary, so nothing loosely typed
/// crosses into the engine.
pub struct LlmDecisionSource {
    http: Client,
    config: DecisionSourceConfig,
}

impl LlmDecisionSource {
    pub fn new(http: Client, config: DecisionSourceConfig) -> Self {
        Self { http, config }
    }

    async fn complete(&self, prompt: String) -> Result<String, DecisionError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.api_base))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| DecisionError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DecisionError::Provider(format!(
                "provider returned HTTP {}",
                response.status()
            )));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| DecisionError::Provider(format!("malformed completion: {e}")))?;

        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| DecisionError::Provider("completion without choices".to_string()))
    }

    fn decision_prompt(
        key: &InstrumentKey,
        bars: &[OhlcvBar],
        indicators: &IndicatorSet,
        context: &DecisionContext,
    ) -> String {
        let close = bars.last().map(|b| b.close).unwrap_or(0.0);
        let past = context
            .past_performance
            .as_deref()
            .unwrap_or("No past performance data available for this item.");

        format!(
            "You are an expert financial analyst for the Indian stock market. Your goal is to \
             provide a clear, evidence-based recommendation by following a structured reasoning \
             process.\n\n\
             **Item for Analysis: {key}**\n\n\
             **1. Quantitative Data:**\n\
             - Close Price: {close:.2}\n\
             - RSI: {rsi}\n\
             - MACD Histogram: {macd}\n\
             - 20-Day SMA: {sma_short}\n\
             - 50-Day SMA: {sma_long}\n\n\
             **2. Past Performance Feedback (your own track record for this item):**\n\
             - {past}\n\n\
             **Your Task: analyze the data and reply with a valid JSON object only.**\n\
             1. Technical Summary: is momentum bullish, bearish, or neutral?\n\
             2. Fundamental Summary: note anything relevant; state when not applicable.\n\
             3. Sentiment Summary: is the market buzz positive, negative, or neutral?\n\
             4. Final Summary: combine all points and state the primary risks.\n\
             5. Final Decision: 'BUY', 'SELL', or 'HOLD' plus a confidence of \
             'High', 'Medium', or 'Low'.\n\n\
             JSON format: {{\"decision\": \"...\", \"confidence\": \"...\", \
             \"technical_summary\": \"...\", \"fundamental_summary\": \"...\", \
             \"sentiment_summary\": \"...\", \"final_summary\": \"...\"}}",
            rsi = fmt_opt(indicators.rsi),
            macd = fmt_opt(indicators.macd.map(|m| m.histogram)),
            sma_short = fmt_opt(indicators.sma_short),
            sma_long = fmt_opt(indicators.sma_long),
        )
    }

    fn forecast_prompt(
        key: &InstrumentKey,
        summary: &MarketSummary,
        week_start: NaiveDate,
        week_end: NaiveDate,
    ) -> String {
        format!(
            "You are an expert market analyst specializing in Indian indices. Provide a \
             day-by-day closing price prediction for {symbol} for the upcoming week \
             ({week_start} to {week_end}).\n\n\
             **Historical Data Summary:**\n\
             - Current Price: {current:.2}\n\
             - 52-Week High: {high:.2}\n\
             - 52-Week Low: {low:.2}\n\
             - 50-Day Average: {fifty:.2}\n\
             - 200-Day Average: {two_hundred:.2}\n\n\
             Reply with a single valid JSON object: a brief overall reasoning and one \
             predicted close per trading day, Monday to Friday. Each price must be a plain \
             JSON number.\n\n\
             JSON format: {{\"weekly_reasoning\": \"...\", \"daily_predictions\": \
             [{{\"day\": \"Monday\", \"predicted_price\": 0.0}}, ...]}}",
            symbol = key.provider_symbol(),
            current = summary.current_price,
            high = summary.year_high,
            low = summary.year_low,
            fifty = summary.fifty_day_avg,
            two_hundred = summary.two_hundred_day_avg,
        )
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "unavailable".to_string(),
    }
}

/// Extract the JSON object embedded in a model reply.
fn extract_json(content: &str) -> Result<&str, DecisionError> {
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&content[start..=end]),
        _ => Err(DecisionError::InvalidResponse(
            "no JSON object in completion".to_string(),
        )),
    }
}

fn parse_signal(content: &str) -> Result<TradeSignal, DecisionError> {
    let raw: RawSignal = serde_json::from_str(extract_json(content)?)
        .map_err(|e| DecisionError::InvalidResponse(e.to_string()))?;
    let action = TradeAction::parse(&raw.decision)?;
    Ok(TradeSignal {
        action,
        confidence: raw.confidence.unwrap_or_else(|| "Low".to_string()),
        technical_summary: raw.technical_summary,
        fundamental_summary: raw.fundamental_summary,
        sentiment_summary: raw.sentiment_summary,
        final_summary: raw.final_summary,
    })
}

fn parse_forecast(content: &str) -> Result<WeeklyForecast, DecisionError> {
    let raw: RawForecast = serde_json::from_str(extract_json(content)?)
        .map_err(|e| DecisionError::InvalidResponse(e.to_string()))?;
    let daily: Vec<DayForecast> = raw
        .daily_predictions
        .into_iter()
        .map(|d| DayForecast {
            day: d.day,
            predicted_close: d.predicted_price,
        })
        .collect();
    let daily = NonEmpty::from_vec(daily).ok_or_else(|| {
        DecisionError::InvalidResponse("forecast contains no daily predictions".to_string())
    })?;
    Ok(WeeklyForecast {
        reasoning: raw.weekly_reasoning,
        daily,
    })
}

#[async_trait]
impl DecisionSource for LlmDecisionSource {
    #[instrument(skip(self, bars, indicators, context), fields(key = %key))]
    async fn decide(
        &self,
        key: &InstrumentKey,
        bars: &[OhlcvBar],
        indicators: &IndicatorSet,
        context: &DecisionContext,
    ) -> Result<TradeSignal, DecisionError> {
        let prompt = Self::decision_prompt(key, bars, indicators, context);
        let content = self.complete(prompt).await?;
        let signal = parse_signal(&content);
        if let Err(e) = &signal {
            warn!(%key, error = %e, "decision payload rejected at boundary");
        }
        signal
    }

    #[instrument(skip(self, summary), fields(key = %key))]
    async fn forecast_week(
        &self,
        key: &InstrumentKey,
        summary: &MarketSummary,
        week_start: NaiveDate,
        week_end: NaiveDate,
    ) -> Result<WeeklyForecast, DecisionError> {
        let prompt = Self::forecast_prompt(key, summary, week_start, week_end);
        let content = self.complete(prompt).await?;
        parse_forecast(&content)
    }
}
