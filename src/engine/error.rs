//! Error taxonomy for the analysis engine.
//!
//! Callers must be able to tell "no fresh data" apart from "data fresh but no
//! decision", so provider failures surface as distinct variants instead of a
//! single opaque error. Every variant is `Clone`: one flight outcome is
//! broadcast to all singleflight waiters.

use serde::Serialize;
use thiserror::Error;

/// Market data provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum FetchError {
    /// The provider does not know this symbol.
    #[error("symbol not found at market data provider")]
    NotFound,
    /// The provider refused the request due to quota exhaustion.
    #[error("market data provider rate limited the request")]
    RateLimited,
    /// Transport or provider-side failure.
    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

/// Decision provider (LLM) failure. Independent of data-fetch failure: a
/// fetch can succeed while decisioning fails.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DecisionError {
    /// The provider call itself failed.
    #[error("decision provider error: {0}")]
    Provider(String),
    /// The provider answered, but the payload did not validate.
    #[error("invalid decision response: {0}")]
    InvalidResponse(String),
}

/// Storage failure. Fatal to the current request; the store never leaves a
/// half-written row behind (single-statement writes, transactions otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

/// Top-level error returned by the coordinator and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// Malformed symbol/exchange, rejected before any I/O.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Provider failure while fetching market data.
    #[error(transparent)]
    DataFetch(#[from] FetchError),
    /// Provider failure while decisioning.
    #[error(transparent)]
    Decision(#[from] DecisionError),
    /// Storage failure.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<StoreError> for AnalysisError {
    fn from(err: StoreError) -> Self {
        AnalysisError::Persistence(err.to_string())
    }
}
