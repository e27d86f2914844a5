//! Walk-forward evaluation engine
//!
//! For every prediction index `i` the model is fitted on rows `[0, i)` and
//! asked for P(up) on row `i` alone. The probability becomes a long/flat
//! position, and the position series becomes a cost-adjusted, compounded
//! strategy return series.

use chrono::NaiveDate;
use ndarray::{s, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::metrics::{compute_metrics, SummaryMetrics};
use crate::models::{ModelAdapter, ModelError};
use crate::types::FeatureTable;

/// Walk-forward run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    /// Leading rows reserved for training before the first prediction
    pub min_train_size: usize,
    /// Rows advanced between successive predictions
    pub step_size: usize,
    /// Go long when P(up) >= threshold
    pub threshold: f64,
    /// Cost per unit of position change, as a fraction (2 bp = 0.0002)
    pub cost_rate: f64,
    /// Evaluate steps on the rayon pool
    #[serde(default)]
    pub parallel: bool,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            min_train_size: 400,
            step_size: 1,
            threshold: 0.55,
            cost_rate: 0.0002,
            parallel: false,
        }
    }
}

impl WalkForwardConfig {
    /// Convert a cost quoted in basis points to a fractional rate
    pub fn cost_rate_from_bp(bp: f64) -> f64 {
        bp / 10_000.0
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_train_size < 1 {
            return Err(EngineError::InvalidConfig(
                "min_train_size must be >= 1".to_string(),
            ));
        }
        if self.step_size < 1 {
            return Err(EngineError::InvalidConfig(
                "step_size must be >= 1".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(EngineError::InvalidConfig(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        if !self.cost_rate.is_finite() || self.cost_rate < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "cost_rate must be a finite value >= 0, got {}",
                self.cost_rate
            )));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Table has {len} rows, fewer than min_train_size = {min_train_size}")]
    InsufficientHistory { len: usize, min_train_size: usize },

    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("No features selected")]
    NoFeatures,

    #[error("Model failed at row {index} ({date}) with {train_rows} training rows: {source}")]
    Model {
        index: usize,
        date: NaiveDate,
        train_rows: usize,
        #[source]
        source: ModelError,
    },

    #[error("Model returned probability {value} at row {index} ({date}); expected a value in [0, 1]")]
    InvalidProbability {
        index: usize,
        date: NaiveDate,
        value: f64,
    },
}

/// Market exposure: flat or fully long
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Position {
    Flat,
    Long,
}

impl Position {
    /// Long iff `probability >= threshold` (ties go long)
    pub fn from_probability(probability: f64, threshold: f64) -> Self {
        if probability >= threshold {
            Position::Long
        } else {
            Position::Flat
        }
    }

    pub fn exposure(&self) -> f64 {
        match self {
            Position::Flat => 0.0,
            Position::Long => 1.0,
        }
    }
}

impl From<Position> for u8 {
    fn from(p: Position) -> Self {
        match p {
            Position::Flat => 0,
            Position::Long => 1,
        }
    }
}

impl TryFrom<u8> for Position {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Position::Flat),
            1 => Ok(Position::Long),
            other => Err(format!("position must be 0 or 1, got {other}")),
        }
    }
}

impl Serialize for Position {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*self))
    }
}

/// One prediction step plus the P&L fields derived after the loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub date: NaiveDate,
    pub probability: f64,
    pub position: Position,
    /// Realized next-day return, read from the table
    pub forward_return: f64,
    pub position_prev: Position,
    pub turnover: f64,
    pub cost: f64,
    pub strategy_return: f64,
    pub equity: f64,
}

impl StepRecord {
    pub fn new(date: NaiveDate, probability: f64, position: Position, forward_return: f64) -> Self {
        Self {
            date,
            probability,
            position,
            forward_return,
            position_prev: Position::Flat,
            turnover: 0.0,
            cost: 0.0,
            strategy_return: 0.0,
            equity: 1.0,
        }
    }
}

/// Date-ordered step records of one walk-forward run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionSeries {
    pub records: Vec<StepRecord>,
}

impl PredictionSeries {
    /// Build a series from raw steps and fill in turnover, cost, strategy
    /// return and compounded equity. The first step's previous position is flat.
    pub fn from_steps(mut records: Vec<StepRecord>, cost_rate: f64) -> Self {
        let mut prev = Position::Flat;
        let mut equity = 1.0;
        for rec in records.iter_mut() {
            rec.position_prev = prev;
            rec.turnover = (rec.position.exposure() - prev.exposure()).abs();
            rec.cost = cost_rate * rec.turnover;
            rec.strategy_return = rec.position.exposure() * rec.forward_return - rec.cost;
            equity *= 1.0 + rec.strategy_return;
            rec.equity = equity;
            prev = rec.position;
        }
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn strategy_returns(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.strategy_return).collect()
    }

    pub fn probabilities(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.probability).collect()
    }

    pub fn equity_curve(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.equity).collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.records.iter().map(|r| r.date).collect()
    }
}

/// Number of predictions a run emits: `ceil((len - 1 - min_train) / step)`, or 0
pub fn expected_steps(len: usize, min_train_size: usize, step_size: usize) -> usize {
    if step_size == 0 || len <= min_train_size + 1 {
        return 0;
    }
    (len - 1 - min_train_size).div_ceil(step_size)
}

/// Walk-forward engine over a feature table
pub struct WalkForwardEngine;

impl WalkForwardEngine {
    /// Run the walk-forward loop and score the resulting strategy returns.
    ///
    /// Prediction indices are `min_train_size, min_train_size + step, ...`
    /// strictly below `len - 1`. A table with `min_train_size <= len <=
    /// min_train_size + 1` yields an empty series and undefined metrics; a
    /// shorter table is rejected.
    pub fn run<M: ModelAdapter + ?Sized>(
        table: &FeatureTable,
        feature_names: &[String],
        config: &WalkForwardConfig,
        model: &M,
    ) -> Result<(PredictionSeries, SummaryMetrics), EngineError> {
        config.validate()?;

        if table.len() < config.min_train_size {
            return Err(EngineError::InsufficientHistory {
                len: table.len(),
                min_train_size: config.min_train_size,
            });
        }
        if feature_names.is_empty() {
            return Err(EngineError::NoFeatures);
        }
        let columns = feature_names
            .iter()
            .map(|name| {
                table
                    .column_index(name)
                    .ok_or_else(|| EngineError::UnknownFeature(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let x = table.select(&columns);
        let indices: Vec<usize> = if table.len() > config.min_train_size + 1 {
            (config.min_train_size..table.len() - 1)
                .step_by(config.step_size)
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            rows = table.len(),
            features = columns.len(),
            steps = indices.len(),
            model = model.name(),
            parallel = config.parallel,
            "Starting walk-forward run"
        );

        let steps = if config.parallel {
            indices
                .par_iter()
                .map(|&i| Self::step(table, &x, i, config.threshold, model))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            indices
                .iter()
                .map(|&i| Self::step(table, &x, i, config.threshold, model))
                .collect::<Result<Vec<_>, _>>()?
        };

        let series = PredictionSeries::from_steps(steps, config.cost_rate);
        let metrics = compute_metrics(&series.strategy_returns());

        debug!(
            steps = series.len(),
            final_equity = series.records.last().map(|r| r.equity).unwrap_or(1.0),
            sharpe = metrics.sharpe,
            "Walk-forward run complete"
        );

        Ok((series, metrics))
    }

    /// Fit on rows `[0, i)` and predict row `i`
    fn step<M: ModelAdapter + ?Sized>(
        table: &FeatureTable,
        x: &Array2<f64>,
        i: usize,
        threshold: f64,
        model: &M,
    ) -> Result<StepRecord, EngineError> {
        let date = table.dates()[i];
        let train_x = x.slice(s![..i, ..]);
        let train_y = &table.labels()[..i];
        let eval_x = x.row(i);

        let probability = model
            .fit_predict(train_x, train_y, eval_x)
            .map_err(|source| EngineError::Model {
                index: i,
                date,
                train_rows: i,
                source,
            })?;

        if !(0.0..=1.0).contains(&probability) {
            return Err(EngineError::InvalidProbability {
                index: i,
                date,
                value: probability,
            });
        }

        Ok(StepRecord::new(
            date,
            probability,
            Position::from_probability(probability, threshold),
            table.forward_returns()[i],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FnModel, LogisticModel};

    fn day(offset: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Duration::days(offset as i64)
    }

    /// `n` rows; column 0 is a marker whose sign matches the forward return
    fn synthetic_table(n: usize) -> FeatureTable {
        let mut features = Array2::<f64>::zeros((n, 3));
        let mut forward = Vec::with_capacity(n);
        for i in 0..n {
            let up = (i * 7 + i / 3) % 5 < 2;
            let magnitude = 0.001 + (i % 13) as f64 * 0.0007;
            features[[i, 0]] = if up { 1.0 + magnitude } else { -1.0 - magnitude };
            features[[i, 1]] = (i as f64 * 0.17).sin();
            features[[i, 2]] = i as f64;
            forward.push(if up { magnitude } else { -magnitude });
        }
        FeatureTable::new(
            (0..n).map(day).collect(),
            vec!["marker".to_string(), "noise".to_string(), "trend".to_string()],
            features,
            forward,
        )
        .unwrap()
    }

    fn names(table: &FeatureTable) -> Vec<String> {
        table.feature_names().to_vec()
    }

    fn marker_model() -> impl ModelAdapter {
        FnModel::new("marker", |_x, _y, eval| {
            Ok(if eval[0] > 0.0 { 1.0 } else { 0.0 })
        })
    }

    fn config(min_train_size: usize, step_size: usize) -> WalkForwardConfig {
        WalkForwardConfig {
            min_train_size,
            step_size,
            threshold: 0.5,
            cost_rate: 0.0,
            parallel: false,
        }
    }

    #[test]
    fn test_end_to_end_marker_model() {
        let table = synthetic_table(260);
        let (series, metrics) =
            WalkForwardEngine::run(&table, &names(&table), &config(200, 1), &marker_model())
                .unwrap();

        assert_eq!(series.len(), 59);
        for (k, rec) in series.records.iter().enumerate() {
            let i = 200 + k;
            assert_eq!(rec.date, table.dates()[i]);
            let marker_positive = table.row(i)[0] > 0.0;
            assert_eq!(rec.position == Position::Long, marker_positive);
            if rec.position == Position::Long {
                assert_eq!(rec.strategy_return, rec.forward_return);
            } else {
                assert_eq!(rec.strategy_return, 0.0);
            }
        }
        // Perfect foresight never loses
        assert_eq!(metrics.max_drawdown, 0.0);
    }

    #[test]
    fn test_series_length_formula() {
        let table = synthetic_table(50);
        for (min_train, step) in [(10, 1), (10, 3), (20, 7), (47, 2), (48, 1), (49, 1), (50, 1)] {
            let (series, _) = WalkForwardEngine::run(
                &table,
                &names(&table),
                &config(min_train, step),
                &marker_model(),
            )
            .unwrap();
            assert_eq!(
                series.len(),
                expected_steps(50, min_train, step),
                "min_train={min_train} step={step}"
            );
        }
        assert_eq!(expected_steps(50, 10, 3), 13);
        assert_eq!(expected_steps(50, 49, 1), 0);
    }

    #[test]
    fn test_degenerate_table_gives_empty_series_and_undefined_metrics() {
        let table = synthetic_table(21);
        let (series, metrics) =
            WalkForwardEngine::run(&table, &names(&table), &config(20, 1), &marker_model())
                .unwrap();
        assert!(series.is_empty());
        assert!(metrics.sharpe.is_nan());
        assert!(metrics.cagr.is_nan());
        assert!(metrics.max_drawdown.is_nan());
        assert!(metrics.win_rate.is_nan());
    }

    #[test]
    fn test_table_shorter_than_min_train_rejected() {
        let table = synthetic_table(10);
        let err = WalkForwardEngine::run(&table, &names(&table), &config(20, 1), &marker_model())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientHistory {
                len: 10,
                min_train_size: 20
            }
        ));
    }

    #[test]
    fn test_training_window_excludes_prediction_row() {
        let table = synthetic_table(40);
        // Encode how many rows were seen and the last training trend value
        let model = FnModel::new("window-check", |x, y, eval| {
            assert_eq!(x.nrows(), y.len());
            let last_seen = x[[x.nrows() - 1, 2]];
            assert!(last_seen < eval[2], "training row {last_seen} >= eval row {}", eval[2]);
            assert_eq!(eval[2] as usize, x.nrows());
            Ok(0.5)
        });
        let (series, _) =
            WalkForwardEngine::run(&table, &names(&table), &config(10, 1), &model).unwrap();
        assert_eq!(series.len(), 29);
    }

    #[test]
    fn test_no_look_ahead_under_mutation() {
        let table = synthetic_table(80);
        let cols = names(&table);
        let cfg = config(40, 1);
        let model = LogisticModel::default();
        let (base, _) = WalkForwardEngine::run(&table, &cols, &cfg, &model).unwrap();

        let k = 15;
        let target = base.records[k].clone();
        let row = 40 + k;
        assert_eq!(target.date, table.dates()[row]);

        // Mutating any row after the predicted one leaves that step untouched
        for mutated_row in [row + 1, row + 10, 79] {
            let mutated = table.with_feature_value(mutated_row, 1, 1e6);
            let (series, _) = WalkForwardEngine::run(&mutated, &cols, &cfg, &model).unwrap();
            assert_eq!(series.records[k].probability, target.probability);
        }

        // Mutating the predicted row itself changes only the evaluation input,
        // so every earlier step is unaffected
        let mutated = table.with_feature_value(row, 1, 1e6);
        let (series, _) = WalkForwardEngine::run(&mutated, &cols, &cfg, &model).unwrap();
        for j in 0..k {
            assert_eq!(series.records[j].probability, base.records[j].probability);
        }
    }

    #[test]
    fn test_threshold_tie_goes_long() {
        assert_eq!(Position::from_probability(0.55, 0.55), Position::Long);
        assert_eq!(Position::from_probability(0.5499999, 0.55), Position::Flat);

        let table = synthetic_table(30);
        let model = FnModel::new("constant", |_x, _y, _eval| Ok(0.55));
        let cfg = WalkForwardConfig {
            threshold: 0.55,
            ..config(10, 1)
        };
        let (series, _) = WalkForwardEngine::run(&table, &names(&table), &cfg, &model).unwrap();
        assert!(series.records.iter().all(|r| r.position == Position::Long));
    }

    #[test]
    fn test_cost_only_on_position_change() {
        let rate = 0.0002;
        let constant = PredictionSeries::from_steps(
            vec![
                StepRecord::new(day(0), 0.9, Position::Long, 0.01),
                StepRecord::new(day(1), 0.9, Position::Long, 0.02),
            ],
            rate,
        );
        // Entering from the implicit flat start costs once on the first step
        assert_eq!(constant.records[0].cost, rate);
        assert_eq!(constant.records[1].cost, 0.0);

        let held_flat = PredictionSeries::from_steps(
            vec![
                StepRecord::new(day(0), 0.1, Position::Flat, 0.01),
                StepRecord::new(day(1), 0.1, Position::Flat, 0.02),
            ],
            rate,
        );
        assert_eq!(held_flat.records[0].cost, 0.0);
        assert_eq!(held_flat.records[1].cost, 0.0);

        let switching = PredictionSeries::from_steps(
            vec![
                StepRecord::new(day(0), 0.1, Position::Flat, 0.01),
                StepRecord::new(day(1), 0.9, Position::Long, 0.02),
                StepRecord::new(day(2), 0.1, Position::Flat, -0.03),
            ],
            rate,
        );
        assert_eq!(switching.records[0].cost, 0.0);
        assert_eq!(switching.records[1].cost, rate * 1.0);
        assert_eq!(switching.records[1].strategy_return, 0.02 - rate);
        assert_eq!(switching.records[2].cost, rate);
        assert_eq!(switching.records[2].strategy_return, -rate);
        assert_eq!(switching.records[1].position_prev, Position::Flat);
        assert_eq!(switching.records[2].position_prev, Position::Long);
    }

    #[test]
    fn test_equity_compounds_strategy_returns() {
        let series = PredictionSeries::from_steps(
            vec![
                StepRecord::new(day(0), 1.0, Position::Long, 0.01),
                StepRecord::new(day(1), 1.0, Position::Long, -0.01),
                StepRecord::new(day(2), 1.0, Position::Long, 0.02),
            ],
            0.0,
        );
        assert_eq!(series.records[2].equity, 1.01 * 0.99 * 1.02);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let table = synthetic_table(90);
        let cols = names(&table);
        let model = LogisticModel::default();
        let seq = config(30, 2);
        let par = WalkForwardConfig {
            parallel: true,
            ..seq.clone()
        };

        let (a, ma) = WalkForwardEngine::run(&table, &cols, &seq, &model).unwrap();
        let (b, mb) = WalkForwardEngine::run(&table, &cols, &par, &model).unwrap();

        assert_eq!(a.dates(), b.dates());
        assert_eq!(a.probabilities(), b.probabilities());
        assert_eq!(a.strategy_returns(), b.strategy_returns());
        assert_eq!(ma.win_rate, mb.win_rate);
        assert!(b.dates().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_model_failure_identifies_step() {
        let table = synthetic_table(30);
        let failing_date = table.dates()[15];
        let model = FnModel::new("fails-late", |x, _y, _eval| {
            if x.nrows() >= 15 {
                Err(ModelError::Failed("boom".to_string()))
            } else {
                Ok(0.5)
            }
        });
        let err = WalkForwardEngine::run(&table, &names(&table), &config(10, 1), &model).unwrap_err();
        match err {
            EngineError::Model {
                index,
                date,
                train_rows,
                source,
            } => {
                assert_eq!(index, 15);
                assert_eq!(date, failing_date);
                assert_eq!(train_rows, 15);
                assert_eq!(source, ModelError::Failed("boom".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let table = synthetic_table(20);
        let model = FnModel::new("broken", |_x, _y, _eval| Ok(f64::NAN));
        let err = WalkForwardEngine::run(&table, &names(&table), &config(10, 1), &model).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProbability { index: 10, .. }));
    }

    #[test]
    fn test_feature_subset_and_unknown_feature() {
        let table = synthetic_table(30);
        let model = FnModel::new("width", |x, _y, eval| {
            assert_eq!(x.ncols(), 1);
            assert_eq!(eval.len(), 1);
            Ok(if eval[0] > 0.0 { 1.0 } else { 0.0 })
        });
        let subset = vec!["marker".to_string()];
        let (series, _) = WalkForwardEngine::run(&table, &subset, &config(10, 1), &model).unwrap();
        assert_eq!(series.len(), 19);

        let bogus = vec!["volume".to_string()];
        let err = WalkForwardEngine::run(&table, &bogus, &config(10, 1), &model).unwrap_err();
        assert!(matches!(err, EngineError::UnknownFeature(ref n) if n == "volume"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let table = synthetic_table(30);
        for cfg in [
            config(0, 1),
            config(10, 0),
            WalkForwardConfig {
                cost_rate: -0.001,
                ..config(10, 1)
            },
            WalkForwardConfig {
                threshold: f64::NAN,
                ..config(10, 1)
            },
        ] {
            let err = WalkForwardEngine::run(&table, &names(&table), &cfg, &marker_model()).unwrap_err();
            assert!(matches!(err, EngineError::InvalidConfig(_)));
        }
    }

    #[test]
    fn test_position_serializes_as_binary() {
        assert_eq!(serde_json::to_string(&Position::Long).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Position::Flat).unwrap(), "0");
        let p: Position = serde_json::from_str("1").unwrap();
        assert_eq!(p, Position::Long);
        assert!(serde_json::from_str::<Position>("2").is_err());
        assert_eq!(WalkForwardConfig::cost_rate_from_bp(2.0), 0.0002);
    }
}
