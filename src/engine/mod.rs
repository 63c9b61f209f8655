//! Analysis engine: cache orchestration, indicators, persistence and the
//! weekly review job.
//!
//! The coordinator is the request-cadence core; the weekly scheduler and the
//! retention sweeper run on their own calendar cadences against the same
//! store.

pub mod coordinator;
pub mod error;
pub mod indicators;
pub mod maintenance;
pub mod sources;
pub mod store;
pub mod types;
pub mod weekly;

// Re-export the main types
pub use error::{AnalysisError, DecisionError, FetchError, StoreError};
pub use types::{
    Analysis, CachedEntry, DecisionRecord, EngineConfig, IndicatorParams, IndicatorSet,
    PerformanceSummary, RequestMode, TradeAction, TradeSignal, WeeklyForecast, WeeklyPrediction,
};

// Re-export the key components
pub use coordinator::FetchCoordinator;
pub use maintenance::RetentionSweeper;
pub use sources::{
    DecisionSource, DecisionSourceConfig, LlmDecisionSource, MarketDataConfig, MarketDataSource,
    YahooChartSource,
};
pub use store::{AnalysisStore, SqliteStore};
pub use weekly::{WeeklyReviewConfig, WeeklyReviewScheduler};
