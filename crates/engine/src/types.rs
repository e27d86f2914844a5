//! Types shared across the walk-forward backtester

use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Kline {
    /// UTC calendar date of the bar open
    pub fn date(&self) -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp_millis(self.open_time).map(|dt| dt.date_naive())
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(f64::NAN)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(f64::NAN)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(f64::NAN)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("Column count mismatch: {names} feature names, {columns} matrix columns")]
    ColumnMismatch { names: usize, columns: usize },

    #[error("Row count mismatch: {dates} dates, {rows} feature rows, {returns} forward returns")]
    RowMismatch {
        dates: usize,
        rows: usize,
        returns: usize,
    },

    #[error("Dates must be strictly increasing: row {index} ({date}) follows {previous}")]
    NonIncreasingDates {
        index: usize,
        date: NaiveDate,
        previous: NaiveDate,
    },

    #[error("Non-finite value in row {index} ({date}), column '{column}'")]
    NonFinite {
        index: usize,
        date: NaiveDate,
        column: String,
    },

    #[error("Duplicate feature name '{0}'")]
    DuplicateFeature(String),
}

/// Time-indexed feature table: one row per trading day.
///
/// Rows are strictly increasing by date and free of missing or infinite
/// values. `labels[i]` is 1 iff `forward_returns[i] > 0`, where the forward
/// return is the realized return from day `i` to day `i + 1`.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    dates: Vec<NaiveDate>,
    feature_names: Vec<String>,
    features: Array2<f64>,
    labels: Vec<u8>,
    forward_returns: Vec<f64>,
}

impl FeatureTable {
    pub fn new(
        dates: Vec<NaiveDate>,
        feature_names: Vec<String>,
        features: Array2<f64>,
        forward_returns: Vec<f64>,
    ) -> Result<Self, TableError> {
        if feature_names.len() != features.ncols() {
            return Err(TableError::ColumnMismatch {
                names: feature_names.len(),
                columns: features.ncols(),
            });
        }
        if dates.len() != features.nrows() || dates.len() != forward_returns.len() {
            return Err(TableError::RowMismatch {
                dates: dates.len(),
                rows: features.nrows(),
                returns: forward_returns.len(),
            });
        }
        for (i, name) in feature_names.iter().enumerate() {
            if feature_names[..i].contains(name) {
                return Err(TableError::DuplicateFeature(name.clone()));
            }
        }
        for i in 1..dates.len() {
            if dates[i] <= dates[i - 1] {
                return Err(TableError::NonIncreasingDates {
                    index: i,
                    date: dates[i],
                    previous: dates[i - 1],
                });
            }
        }
        for (i, row) in features.axis_iter(Axis(0)).enumerate() {
            if let Some(col) = row.iter().position(|v| !v.is_finite()) {
                return Err(TableError::NonFinite {
                    index: i,
                    date: dates[i],
                    column: feature_names[col].clone(),
                });
            }
            if !forward_returns[i].is_finite() {
                return Err(TableError::NonFinite {
                    index: i,
                    date: dates[i],
                    column: "forward_return".to_string(),
                });
            }
        }

        let labels = forward_returns
            .iter()
            .map(|&r| u8::from(r > 0.0))
            .collect();

        Ok(Self {
            dates,
            feature_names,
            features,
            labels,
            forward_returns,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.features.row(index)
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn forward_returns(&self) -> &[f64] {
        &self.forward_returns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }

    /// Copy of the feature matrix restricted to `columns` (in the given order)
    pub fn select(&self, columns: &[usize]) -> Array2<f64> {
        self.features.select(Axis(1), columns)
    }

    /// Copy of the table with one feature cell replaced
    pub fn with_feature_value(&self, row: usize, column: usize, value: f64) -> Self {
        let mut next = self.clone();
        next.features[[row, column]] = value;
        next
    }
}
