//! Core types and data structures for the stocksage signal engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::engine::error::AnalysisError;

/// Exchange an instrument trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "NSE")]
    Nse,
    #[serde(rename = "BSE")]
    Bse,
}

impl Exchange {
    /// Provider ticker suffix for this exchange.
    pub fn suffix(&self) -> &'static str {
        match self {
            Exchange::Nse => ".NS",
            Exchange::Bse => ".BO",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Nse => write!(f, "NSE"),
            Exchange::Bse => write!(f, "BSE"),
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NSE" => Ok(Exchange::Nse),
            "BSE" => Ok(Exchange::Bse),
            other => Err(AnalysisError::Validation(format!(
                "unknown exchange: {other}"
            ))),
        }
    }
}

/// Normalized (symbol, exchange) pair identifying one cacheable instrument.
///
/// Equity symbols are uppercased and carry the exchange suffix (`.NS`/`.BO`);
/// index symbols start with `^` and pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub exchange: Exchange,
}

impl InstrumentKey {
    /// Validate and normalize a raw symbol for `exchange`.
    ///
    /// Rejects empty symbols and characters outside the ticker alphabet
    /// (`A-Z 0-9 . & -`, plus a leading `^` for indices) before any I/O.
    pub fn new(raw: &str, exchange: Exchange) -> Result<Self, AnalysisError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AnalysisError::Validation("empty symbol".to_string()));
        }

        let is_index = trimmed.starts_with('^');
        let body = if is_index { &trimmed[1..] } else { trimmed };
        if body.is_empty() {
            return Err(AnalysisError::Validation(format!(
                "malformed symbol: {trimmed}"
            )));
        }
        if let Some(bad) = body
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '&' | '-')))
        {
            return Err(AnalysisError::Validation(format!(
                "symbol {trimmed:?} contains invalid character {bad:?}"
            )));
        }

        let upper = trimmed.to_ascii_uppercase();
        let symbol = if is_index || upper.ends_with(".NS") || upper.ends_with(".BO") {
            upper
        } else {
            format!("{upper}{}", exchange.suffix())
        };

        Ok(Self { symbol, exchange })
    }

    /// Symbol in the form the market data provider expects.
    pub fn provider_symbol(&self) -> &str {
        &self.symbol
    }

    /// Whether this key refers to a market index rather than an equity.
    pub fn is_index(&self) -> bool {
        self.symbol.starts_with('^')
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.symbol, self.exchange)
    }
}

/// One daily Open-High-Low-Close-Volume bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Millisecond Unix timestamp helpers used at the storage boundary.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
