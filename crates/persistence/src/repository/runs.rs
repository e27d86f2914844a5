//! Backtest runs repository: one row per (symbol, model, config) run

use crate::DbResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A completed walk-forward run as stored in SQLite
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub run_hash: String,
    pub symbol: String,
    pub model: String,
    pub period: String,
    pub config_json: String,
    pub n_samples: i64,
    pub n_predictions: i64,
    pub sharpe: Option<f64>,
    pub cagr: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub win_rate: Option<f64>,
    pub auc: Option<f64>,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
    pub artifact_dir: Option<String>,
    pub created_at: Option<i64>,
}

impl BacktestRunRecord {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }
}

/// SQLite cannot hold NaN; undefined metrics become NULL.
pub fn defined(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Repository for backtest run results
pub struct RunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run (INSERT OR REPLACE; a rerun with the same hash overwrites the old row)
    pub async fn save(&self, record: &BacktestRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO backtest_runs (
                run_hash, symbol, model, period, config_json,
                n_samples, n_predictions,
                sharpe, cagr, max_drawdown, win_rate, auc,
                first_date, last_date, artifact_dir
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.run_hash)
        .bind(&record.symbol)
        .bind(&record.model)
        .bind(&record.period)
        .bind(&record.config_json)
        .bind(record.n_samples)
        .bind(record.n_predictions)
        .bind(record.sharpe.and_then(defined))
        .bind(record.cagr.and_then(defined))
        .bind(record.max_drawdown.and_then(defined))
        .bind(record.win_rate.and_then(defined))
        .bind(record.auc.and_then(defined))
        .bind(&record.first_date)
        .bind(&record.last_date)
        .bind(&record.artifact_dir)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent runs across all symbols
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<BacktestRunRecord>> {
        let records = sqlx::query_as::<_, BacktestRunRecord>(
            "SELECT * FROM backtest_runs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Most recent runs for one symbol
    pub async fn list_by_symbol(&self, symbol: &str, limit: i64) -> DbResult<Vec<BacktestRunRecord>> {
        let records = sqlx::query_as::<_, BacktestRunRecord>(
            "SELECT * FROM backtest_runs WHERE symbol = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn make_record(hash: &str, symbol: &str, sharpe: f64) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            run_hash: hash.to_string(),
            symbol: symbol.to_string(),
            model: "gbm".to_string(),
            period: "5y".to_string(),
            config_json: "{}".to_string(),
            n_samples: 1200,
            n_predictions: 799,
            sharpe: Some(sharpe),
            cagr: Some(0.12),
            max_drawdown: Some(-0.2),
            win_rate: Some(0.51),
            auc: Some(f64::NAN),
            first_date: Some("2021-01-01".to_string()),
            last_date: Some("2024-01-01".to_string()),
            artifact_dir: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        repo.save(&make_record("a", "BTCUSDT", 1.1)).await.unwrap();
        repo.save(&make_record("b", "ETHUSDT", 0.4)).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        let btc = repo.list_by_symbol("BTCUSDT", 10).await.unwrap();
        assert_eq!(btc.len(), 1);
        assert_eq!(btc[0].sharpe, Some(1.1));
        assert!(btc[0].created_at_utc().is_some());
    }

    #[tokio::test]
    async fn test_nan_metric_stored_as_null() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        repo.save(&make_record("a", "BTCUSDT", f64::NAN)).await.unwrap();
        let rows = repo.list_recent(5).await.unwrap();
        assert_eq!(rows[0].sharpe, None);
        assert_eq!(rows[0].auc, None);
    }

    #[tokio::test]
    async fn test_same_hash_replaces() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        repo.save(&make_record("same", "BTCUSDT", 0.5)).await.unwrap();
        repo.save(&make_record("same", "BTCUSDT", 0.9)).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        let rows = repo.list_recent(5).await.unwrap();
        assert_eq!(rows[0].sharpe, Some(0.9));
    }
}
