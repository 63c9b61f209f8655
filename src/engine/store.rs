//! Storage layer for cached market data, decisions and weekly predictions.
//!
//! `AnalysisStore` is the formal persistence contract; `SqliteStore` is the
//! SQLite implementation. All mutations are durable and atomic per key:
//! cache writes are single-row upserts, back-fills are guarded single
//! UPDATEs, so a failed request never leaves a half-written row.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nonempty::NonEmpty;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::error::StoreError;
use crate::engine::types::{
    CachedEntry, DayForecast, DecisionRecord, IndicatorSet, PerformanceSummary, PredictionStatus,
    TradeAction, TradeOutcome, TradeSignal, WeeklyForecast, WeeklyPrediction,
};
use crate::types::{from_millis, to_millis, Exchange, InstrumentKey, OhlcvBar};

/// Formal contract for the engine's persistent state.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Look up the cache entry for a key. A missing key is `Ok(None)`,
    /// never an error.
    async fn get_cached(&self, key: &InstrumentKey) -> Result<Option<CachedEntry>, StoreError>;

    /// Idempotent upsert: overwrites any prior entry for the same key.
    async fn put_cached(&self, entry: &CachedEntry) -> Result<(), StoreError>;

    /// Delete cache entries last updated before `horizon`. Returns the
    /// number of rows removed.
    async fn sweep_cache_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Persist one completed decision and return the stored record.
    async fn insert_decision(
        &self,
        key: &InstrumentKey,
        signal: &TradeSignal,
        price_at_decision: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<DecisionRecord, StoreError>;

    /// Most recent decision for a key, if any.
    async fn latest_decision(&self, key: &InstrumentKey)
        -> Result<Option<DecisionRecord>, StoreError>;

    /// Past decisions for a key, newest first.
    async fn decision_history(
        &self,
        key: &InstrumentKey,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, StoreError>;

    /// Recent decisions for a key whose P&L has been realized, newest first.
    /// Feeds the past-performance context of the decision prompt.
    async fn recent_closed_decisions(
        &self,
        key: &InstrumentKey,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, StoreError>;

    /// BUY/SELL decisions still waiting for a realized P&L.
    async fn unrealized_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError>;

    /// Back-fill realized P&L for one decision. Returns false when the row
    /// already has a P&L (the back-fill happens at most once).
    async fn set_profit_loss(&self, id: i64, pnl_percent: f64) -> Result<bool, StoreError>;

    /// Delete decisions older than `horizon`. Returns the rows removed.
    async fn sweep_decisions_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Aggregate track record over closed BUY/SELL decisions.
    async fn performance_summary(&self) -> Result<PerformanceSummary, StoreError>;

    /// Insert a new weekly prediction in `PENDING` state; returns its id.
    async fn insert_prediction(
        &self,
        symbol: &str,
        prediction_date: NaiveDate,
        week_start: NaiveDate,
        week_end: NaiveDate,
        forecast: &WeeklyForecast,
    ) -> Result<i64, StoreError>;

    /// Whether a prediction already exists for (symbol, week_start).
    async fn prediction_exists(&self, symbol: &str, week_start: NaiveDate)
        -> Result<bool, StoreError>;

    /// All `PENDING` predictions whose week ended on or before `date`.
    async fn pending_predictions_ended_by(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<WeeklyPrediction>, StoreError>;

    /// Apply the `PENDING -> RECONCILED` transition, writing the actual
    /// close and performance summary atomically. Returns false when the row
    /// was already reconciled (no state change).
    async fn reconcile_prediction(
        &self,
        id: i64,
        actual_close: f64,
        summary: &str,
    ) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<bool, StoreError>;
}

#[derive(FromRow)]
struct CacheRow {
    symbol: String,
    exchange: String,
    bars: String,
    indicators: String,
    last_updated: i64,
}

#[derive(FromRow)]
struct DecisionRow {
    id: i64,
    symbol: String,
    exchange: String,
    decision: String,
    confidence: String,
    technical_summary: Option<String>,
    fundamental_summary: Option<String>,
    sentiment_summary: Option<String>,
    final_summary: Option<String>,
    price_at_decision: f64,
    timestamp: i64,
    profit_loss: Option<f64>,
}

#[derive(FromRow)]
struct PredictionRow {
    id: i64,
    symbol: String,
    prediction_date: String,
    week_start_date: String,
    week_end_date: String,
    daily_predictions: String,
    weekly_reasoning: String,
    actual_closing_price: Option<f64>,
    performance_summary: Option<String>,
    status: String,
}

/// SQLite implementation of `AnalysisStore`.
///
/// A write-through moka cache sits in front of the database and only ever
/// holds entries that were fresh when read or written, so the hottest path
/// (a fresh TTL hit) never touches SQLite.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    hot: moka::future::Cache<InstrumentKey, CachedEntry>,
    cache_ttl: Duration,
}

impl SqliteStore {
    /// Connect to a database file, creating it and the schema on first use.
    pub async fn open(path: &str, cache_ttl: Duration) -> Result<Arc<Self>, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;
        let store = Self::with_pool(pool, cache_ttl).await?;
        info!("SqliteStore initialized and connected to {}", path);
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same in-memory instance.
    pub async fn in_memory(cache_ttl: Duration) -> Result<Arc<Self>, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, cache_ttl).await
    }

    async fn with_pool(pool: Pool<Sqlite>, cache_ttl: Duration) -> Result<Arc<Self>, StoreError> {
        Self::create_schema(&pool).await?;
        let hot = moka::future::Cache::builder()
            .max_capacity(4096)
            .time_to_live(cache_ttl)
            .build();
        Ok(Arc::new(Self {
            pool,
            hot,
            cache_ttl,
        }))
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stock_data_cache (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                bars TEXT NOT NULL,
                indicators TEXT NOT NULL,
                last_updated INTEGER NOT NULL,
                PRIMARY KEY (symbol, exchange)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                decision TEXT NOT NULL,
                confidence TEXT NOT NULL,
                technical_summary TEXT,
                fundamental_summary TEXT,
                sentiment_summary TEXT,
                final_summary TEXT,
                price_at_decision REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                profit_loss REAL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weekly_index_predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                prediction_date TEXT NOT NULL,
                week_start_date TEXT NOT NULL,
                week_end_date TEXT NOT NULL,
                daily_predictions TEXT NOT NULL,
                weekly_reasoning TEXT NOT NULL,
                actual_closing_price REAL,
                performance_summary TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                UNIQUE (symbol, week_start_date)
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_entry(row: CacheRow) -> Result<CachedEntry, StoreError> {
        let exchange = Exchange::from_str(&row.exchange)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let bars: Vec<OhlcvBar> = serde_json::from_str(&row.bars)?;
        let indicators: IndicatorSet = serde_json::from_str(&row.indicators)?;
        Ok(CachedEntry {
            key: InstrumentKey {
                symbol: row.symbol,
                exchange,
            },
            bars,
            indicators,
            last_updated: from_millis(row.last_updated),
        })
    }

    fn row_to_decision(row: DecisionRow) -> Result<DecisionRecord, StoreError> {
        let exchange = Exchange::from_str(&row.exchange)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let action = TradeAction::parse(&row.decision)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(DecisionRecord {
            id: row.id,
            key: InstrumentKey {
                symbol: row.symbol,
                exchange,
            },
            signal: TradeSignal {
                action,
                confidence: row.confidence,
                technical_summary: row.technical_summary,
                fundamental_summary: row.fundamental_summary,
                sentiment_summary: row.sentiment_summary,
                final_summary: row.final_summary,
            },
            price_at_decision: row.price_at_decision,
            timestamp: from_millis(row.timestamp),
            profit_loss: row.profit_loss,
        })
    }

    /// Closed trade with the largest (`DESC`) or smallest (`ASC`) P&L.
    async fn extreme_trade(&self, order: &str) -> Result<Option<TradeOutcome>, StoreError> {
        let sql = format!(
            "SELECT * FROM decisions WHERE profit_loss IS NOT NULL \
             AND decision IN ('BUY', 'SELL') ORDER BY profit_loss {order} LIMIT 1"
        );
        let row: Option<DecisionRow> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        Ok(row
            .map(Self::row_to_decision)
            .transpose()?
            .map(|r| TradeOutcome {
                symbol: r.key.symbol,
                action: r.signal.action,
                profit_loss: r.profit_loss.unwrap_or(0.0),
                timestamp: r.timestamp,
            }))
    }

    fn row_to_prediction(row: PredictionRow) -> Result<WeeklyPrediction, StoreError> {
        let daily: Vec<DayForecast> = serde_json::from_str(&row.daily_predictions)?;
        let daily = NonEmpty::from_vec(daily)
            .ok_or_else(|| StoreError::Encoding("empty day-wise forecast".to_string()))?;
        let parse_date = |raw: &str| {
            raw.parse::<NaiveDate>()
                .map_err(|e| StoreError::Encoding(format!("bad date {raw:?}: {e}")))
        };
        Ok(WeeklyPrediction {
            id: row.id,
            symbol: row.symbol,
            prediction_date: parse_date(&row.prediction_date)?,
            week_start: parse_date(&row.week_start_date)?,
            week_end: parse_date(&row.week_end_date)?,
            forecast: WeeklyForecast {
                reasoning: row.weekly_reasoning,
                daily,
            },
            actual_close: row.actual_closing_price,
            performance_summary: row.performance_summary,
            status: PredictionStatus::parse(&row.status)
                .map_err(|e| StoreError::Encoding(e.to_string()))?,
        })
    }
}

#[async_trait]
impl AnalysisStore for SqliteStore {
    async fn get_cached(&self, key: &InstrumentKey) -> Result<Option<CachedEntry>, StoreError> {
        if let Some(entry) = self.hot.get(key).await {
            debug!(%key, "cache entry served from hot layer");
            return Ok(Some(entry));
        }

        let row: Option<CacheRow> = sqlx::query_as(
            "SELECT symbol, exchange, bars, indicators, last_updated \
             FROM stock_data_cache WHERE symbol = ? AND exchange = ?",
        )
        .bind(&key.symbol)
        .bind(key.exchange.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let entry = Self::row_to_entry(row)?;
                // Only fresh entries enter the hot layer; stale rows stay
                // SQLite-only until the sweep or the next refresh.
                if entry.is_fresh(self.cache_ttl) {
                    self.hot.insert(key.clone(), entry.clone()).await;
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put_cached(&self, entry: &CachedEntry) -> Result<(), StoreError> {
        let bars = serde_json::to_string(&entry.bars)?;
        let indicators = serde_json::to_string(&entry.indicators)?;

        sqlx::query(
            r#"
            INSERT INTO stock_data_cache (symbol, exchange, bars, indicators, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (symbol, exchange) DO UPDATE SET
                bars = excluded.bars,
                indicators = excluded.indicators,
                last_updated = excluded.last_updated;
            "#,
        )
        .bind(&entry.key.symbol)
        .bind(entry.key.exchange.to_string())
        .bind(bars)
        .bind(indicators)
        .bind(to_millis(entry.last_updated))
        .execute(&self.pool)
        .await?;

        self.hot.insert(entry.key.clone(), entry.clone()).await;
        debug!(key = %entry.key, "cache entry upserted");
        Ok(())
    }

    async fn sweep_cache_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM stock_data_cache WHERE last_updated < ?")
            .bind(to_millis(horizon))
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        // A swept row must not survive in the hot layer.
        if removed > 0 {
            self.hot.invalidate_all();
        }
        Ok(removed)
    }

    async fn insert_decision(
        &self,
        key: &InstrumentKey,
        signal: &TradeSignal,
        price_at_decision: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<DecisionRecord, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO decisions (
                symbol, exchange, decision, confidence,
                technical_summary, fundamental_summary, sentiment_summary, final_summary,
                price_at_decision, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&key.symbol)
        .bind(key.exchange.to_string())
        .bind(signal.action.as_str())
        .bind(&signal.confidence)
        .bind(&signal.technical_summary)
        .bind(&signal.fundamental_summary)
        .bind(&signal.sentiment_summary)
        .bind(&signal.final_summary)
        .bind(price_at_decision)
        .bind(to_millis(timestamp))
        .execute(&self.pool)
        .await?;

        debug!(%key, action = %signal.action, "decision persisted");
        Ok(DecisionRecord {
            id: result.last_insert_rowid(),
            key: key.clone(),
            signal: signal.clone(),
            price_at_decision,
            timestamp,
            profit_loss: None,
        })
    }

    async fn latest_decision(
        &self,
        key: &InstrumentKey,
    ) -> Result<Option<DecisionRecord>, StoreError> {
        let row: Option<DecisionRow> = sqlx::query_as(
            "SELECT * FROM decisions WHERE symbol = ? AND exchange = ? \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(&key.symbol)
        .bind(key.exchange.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_decision).transpose()
    }

    async fn decision_history(
        &self,
        key: &InstrumentKey,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            "SELECT * FROM decisions WHERE symbol = ? AND exchange = ? \
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(&key.symbol)
        .bind(key.exchange.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_decision).collect()
    }

    async fn recent_closed_decisions(
        &self,
        key: &InstrumentKey,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            "SELECT * FROM decisions WHERE symbol = ? AND exchange = ? \
             AND profit_loss IS NOT NULL ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(&key.symbol)
        .bind(key.exchange.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_decision).collect()
    }

    async fn unrealized_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            "SELECT * FROM decisions WHERE profit_loss IS NULL \
             AND decision IN ('BUY', 'SELL') ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_decision).collect()
    }

    async fn set_profit_loss(&self, id: i64, pnl_percent: f64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE decisions SET profit_loss = ? WHERE id = ? AND profit_loss IS NULL")
                .bind(pnl_percent)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_decisions_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM decisions WHERE timestamp < ?")
            .bind(to_millis(horizon))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn performance_summary(&self) -> Result<PerformanceSummary, StoreError> {
        let (total, wins, avg_pnl): (i64, i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN profit_loss > 0 THEN 1 ELSE 0 END), 0), \
                    COALESCE(AVG(profit_loss), 0.0) \
             FROM decisions WHERE profit_loss IS NOT NULL AND decision IN ('BUY', 'SELL')",
        )
        .fetch_one(&self.pool)
        .await?;

        if total == 0 {
            return Ok(PerformanceSummary {
                total_trades: 0,
                win_rate_percent: 0.0,
                average_pnl_percent: 0.0,
                best_trade: None,
                worst_trade: None,
            });
        }

        let best_trade = self.extreme_trade("DESC").await?;
        let worst_trade = self.extreme_trade("ASC").await?;

        Ok(PerformanceSummary {
            total_trades: total,
            win_rate_percent: wins as f64 / total as f64 * 100.0,
            average_pnl_percent: avg_pnl,
            best_trade,
            worst_trade,
        })
    }

    async fn insert_prediction(
        &self,
        symbol: &str,
        prediction_date: NaiveDate,
        week_start: NaiveDate,
        week_end: NaiveDate,
        forecast: &WeeklyForecast,
    ) -> Result<i64, StoreError> {
        let daily = serde_json::to_string(&forecast.daily)?;
        let result = sqlx::query(
            r#"
            INSERT INTO weekly_index_predictions
                (symbol, prediction_date, week_start_date, week_end_date,
                 daily_predictions, weekly_reasoning, status)
            VALUES (?, ?, ?, ?, ?, ?, 'PENDING');
            "#,
        )
        .bind(symbol)
        .bind(prediction_date.to_string())
        .bind(week_start.to_string())
        .bind(week_end.to_string())
        .bind(daily)
        .bind(&forecast.reasoning)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn prediction_exists(
        &self,
        symbol: &str,
        week_start: NaiveDate,
    ) -> Result<bool, StoreError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM weekly_index_predictions \
             WHERE symbol = ? AND week_start_date = ?",
        )
        .bind(symbol)
        .bind(week_start.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    async fn pending_predictions_ended_by(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<WeeklyPrediction>, StoreError> {
        let rows: Vec<PredictionRow> = sqlx::query_as(
            "SELECT * FROM weekly_index_predictions \
             WHERE status = 'PENDING' AND week_end_date <= ? \
             ORDER BY week_start_date ASC, symbol ASC",
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_prediction).collect()
    }

    async fn reconcile_prediction(
        &self,
        id: i64,
        actual_close: f64,
        summary: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE weekly_index_predictions
            SET actual_closing_price = ?, performance_summary = ?, status = 'RECONCILED'
            WHERE id = ? AND status = 'PENDING';
            "#,
        )
        .bind(actual_close)
        .bind(summary)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::IndicatorSet;
    use chrono::Days;

    const TTL: Duration = Duration::from_secs(3600);

    fn key(symbol: &str) -> InstrumentKey {
        InstrumentKey::new(symbol, Exchange::Nse).unwrap()
    }

    fn entry(symbol: &str, close: f64, last_updated: DateTime<Utc>) -> CachedEntry {
        CachedEntry {
            key: key(symbol),
            bars: vec![OhlcvBar {
                date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
                open: close,
                high: close + 2.0,
                low: close - 2.0,
                close,
                volume: 10_000,
            }],
            indicators: IndicatorSet::default(),
            last_updated,
        }
    }

    fn signal(action: TradeAction) -> TradeSignal {
        TradeSignal {
            action,
            confidence: "High".to_string(),
            technical_summary: Some("momentum bullish".to_string()),
            fundamental_summary: None,
            sentiment_summary: None,
            final_summary: Some("test".to_string()),
        }
    }

    fn forecast() -> WeeklyForecast {
        WeeklyForecast {
            reasoning: "steady uptrend".to_string(),
            daily: NonEmpty::from_vec(vec![
                DayForecast {
                    day: "Monday".to_string(),
                    predicted_close: 25_800.0,
                },
                DayForecast {
                    day: "Tuesday".to_string(),
                    predicted_close: 25_850.0,
                },
            ])
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn read_after_write_returns_fresh_payload() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let written = entry("RELIANCE", 2_900.0, Utc::now());

        store.put_cached(&written).await.unwrap();
        let read = store.get_cached(&written.key).await.unwrap().unwrap();

        assert_eq!(read, written);
        assert!(read.is_fresh(TTL));
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        assert!(store.get_cached(&key("TCS")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_an_upsert() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let first = entry("INFY", 1_500.0, Utc::now() - chrono::Duration::minutes(10));
        let second = entry("INFY", 1_520.0, Utc::now());

        store.put_cached(&first).await.unwrap();
        store.put_cached(&second).await.unwrap();

        let read = store.get_cached(&first.key).await.unwrap().unwrap();
        assert_eq!(read.bars[0].close, 1_520.0);
    }

    #[tokio::test]
    async fn sweep_removes_only_rows_past_horizon() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let old = entry("TCS", 3_400.0, Utc::now() - chrono::Duration::hours(30));
        let recent = entry("INFY", 1_500.0, Utc::now());
        store.put_cached(&old).await.unwrap();
        store.put_cached(&recent).await.unwrap();

        let removed = store
            .sweep_cache_older_than(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_cached(&recent.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profit_loss_backfills_at_most_once() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let record = store
            .insert_decision(&key("RELIANCE"), &signal(TradeAction::Buy), 2_900.0, Utc::now())
            .await
            .unwrap();

        assert!(store.set_profit_loss(record.id, 3.5).await.unwrap());
        assert!(!store.set_profit_loss(record.id, 9.9).await.unwrap());

        let stored = store.latest_decision(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.profit_loss, Some(3.5));
    }

    #[tokio::test]
    async fn decision_history_is_newest_first() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let k = key("TCS");
        let base = Utc::now() - chrono::Duration::hours(2);
        for (i, action) in [TradeAction::Buy, TradeAction::Hold, TradeAction::Sell]
            .into_iter()
            .enumerate()
        {
            store
                .insert_decision(&k, &signal(action), 100.0 + i as f64, base + chrono::Duration::minutes(i as i64))
                .await
                .unwrap();
        }

        let history = store.decision_history(&k, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].signal.action, TradeAction::Sell);
        assert_eq!(history[2].signal.action, TradeAction::Buy);
    }

    #[tokio::test]
    async fn reconcile_transitions_exactly_once() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let id = store
            .insert_prediction(
                "^NSEI",
                week_start - Days::new(2),
                week_start,
                week_start + Days::new(4),
                &forecast(),
            )
            .await
            .unwrap();

        assert!(store.reconcile_prediction(id, 25_900.0, "Avg Daily Error: 0.4%").await.unwrap());
        assert!(!store.reconcile_prediction(id, 1.0, "again").await.unwrap());

        let pending = store
            .pending_predictions_ended_by(week_start + Days::new(30))
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn prediction_exists_matches_symbol_and_week() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let week_start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        store
            .insert_prediction("^NSEI", week_start, week_start, week_start + Days::new(4), &forecast())
            .await
            .unwrap();

        assert!(store.prediction_exists("^NSEI", week_start).await.unwrap());
        assert!(!store.prediction_exists("^BSESN", week_start).await.unwrap());
        assert!(!store
            .prediction_exists("^NSEI", week_start + Days::new(7))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn performance_summary_aggregates_closed_trades() {
        let store = SqliteStore::in_memory(TTL).await.unwrap();
        let k = key("RELIANCE");
        let now = Utc::now();

        let win = store
            .insert_decision(&k, &signal(TradeAction::Buy), 100.0, now)
            .await
            .unwrap();
        let loss = store
            .insert_decision(&k, &signal(TradeAction::Sell), 200.0, now)
            .await
            .unwrap();
        // HOLD rows never enter the trade statistics.
        store
            .insert_decision(&k, &signal(TradeAction::Hold), 300.0, now)
            .await
            .unwrap();
        store.set_profit_loss(win.id, 4.0).await.unwrap();
        store.set_profit_loss(loss.id, -2.0).await.unwrap();

        let summary = store.performance_summary().await.unwrap();
        assert_eq!(summary.total_trades, 2);
        assert!((summary.win_rate_percent - 50.0).abs() < 1e-9);
        assert!((summary.average_pnl_percent - 1.0).abs() < 1e-9);
        assert_eq!(summary.best_trade.unwrap().profit_loss, 4.0);
        assert_eq!(summary.worst_trade.unwrap().profit_loss, -2.0);
    }
}
