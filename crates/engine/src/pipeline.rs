//! Per-symbol backtest orchestration
//!
//! fetch → features → walk-forward → AUC → artifacts → optional run record.
//! Each symbol is independent: a failure is reported alongside the other
//! symbols' reports instead of aborting the batch.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use persistence::repository::{defined, BacktestRunRecord, RunRepository};
use persistence::SqlitePool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::artifacts::{save_artifacts, save_report};
use crate::data::{fetch_prices, HistoryPeriod, PriceSource, RetryPolicy};
use crate::engine::{PredictionSeries, WalkForwardConfig, WalkForwardEngine};
use crate::features::{make_features, FEATURE_COLUMNS};
use crate::metrics::{evaluate_auc, SummaryMetrics};
use crate::models::ModelKind;

/// Smallest training window the pipeline will accept
pub const MIN_TRAIN_FLOOR: usize = 200;

/// One batch of backtests; also the JSON body of `POST /api/backtest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub period: HistoryPeriod,
    #[serde(default)]
    pub model: ModelKind,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_min_train")]
    pub min_train_size: usize,
    #[serde(default = "default_step")]
    pub step_size: usize,
    #[serde(default = "default_cost_bp")]
    pub cost_bp: f64,
    #[serde(default)]
    pub parallel: bool,
}

fn default_threshold() -> f64 {
    WalkForwardConfig::default().threshold
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_min_train() -> usize {
    WalkForwardConfig::default().min_train_size
}

fn default_step() -> usize {
    1
}

fn default_cost_bp() -> f64 {
    2.0
}

impl PipelineRequest {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            period: HistoryPeriod::default(),
            model: ModelKind::default(),
            threshold: default_threshold(),
            out_dir: default_out_dir(),
            min_train_size: default_min_train(),
            step_size: default_step(),
            cost_bp: default_cost_bp(),
            parallel: false,
        }
    }

    /// Engine config with `min_train_size` floored at [`MIN_TRAIN_FLOOR`]
    pub fn walk_forward_config(&self) -> WalkForwardConfig {
        WalkForwardConfig {
            min_train_size: self.min_train_size.max(MIN_TRAIN_FLOOR),
            step_size: self.step_size,
            threshold: self.threshold,
            cost_rate: WalkForwardConfig::cost_rate_from_bp(self.cost_bp),
            parallel: self.parallel,
        }
    }
}

/// Summary of one symbol's completed backtest
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub symbol: String,
    pub model: ModelKind,
    pub period: HistoryPeriod,
    /// Rows in the feature table
    pub n_samples: usize,
    pub n_predictions: usize,
    pub metrics: SummaryMetrics,
    pub auc: f64,
    pub config: WalkForwardConfig,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub final_equity: f64,
    pub artifact_dir: PathBuf,
    pub run_hash: String,
}

/// Outcome for one requested symbol
#[derive(Debug)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub result: Result<BacktestReport>,
}

/// Short stable identifier of (symbol, model, period, config)
pub fn run_hash(
    symbol: &str,
    model: ModelKind,
    period: HistoryPeriod,
    config: &WalkForwardConfig,
) -> String {
    let input = format!(
        "{symbol}|{model}|{period}|{}|{}|{}|{}",
        config.min_train_size, config.step_size, config.threshold, config.cost_rate
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)[..16].to_string()
}

/// Run every symbol in `request`, sequentially, with the default retry policy
pub async fn run_pipeline(
    request: &PipelineRequest,
    source: &dyn PriceSource,
    db: Option<&SqlitePool>,
) -> Vec<SymbolOutcome> {
    run_pipeline_with_retry(request, source, db, &RetryPolicy::default()).await
}

pub async fn run_pipeline_with_retry(
    request: &PipelineRequest,
    source: &dyn PriceSource,
    db: Option<&SqlitePool>,
    retry: &RetryPolicy,
) -> Vec<SymbolOutcome> {
    info!(
        symbols = ?request.symbols,
        period = %request.period,
        model = %request.model,
        threshold = request.threshold,
        "Starting backtest pipeline"
    );

    let mut outcomes = Vec::with_capacity(request.symbols.len());
    for symbol in &request.symbols {
        let result = run_symbol(request, symbol, source, db, retry).await;
        match &result {
            Ok(report) => info!(
                symbol = %symbol,
                predictions = report.n_predictions,
                sharpe = report.metrics.sharpe,
                auc = report.auc,
                "Backtest complete"
            ),
            Err(e) => error!(symbol = %symbol, error = %format!("{e:#}"), "Backtest failed"),
        }
        outcomes.push(SymbolOutcome {
            symbol: symbol.clone(),
            result,
        });
    }
    outcomes
}

/// Backtest a single symbol end to end
pub async fn run_symbol(
    request: &PipelineRequest,
    symbol: &str,
    source: &dyn PriceSource,
    db: Option<&SqlitePool>,
    retry: &RetryPolicy,
) -> Result<BacktestReport> {
    let config = request.walk_forward_config();
    config.validate()?;

    let klines = fetch_prices(source, symbol, request.period, retry).await?;
    let table = make_features(&klines)
        .with_context(|| format!("Feature engineering failed for {symbol}"))?;
    info!(symbol = %symbol, rows = table.len(), "Features ready");

    let kind = request.model;
    let engine_config = config.clone();
    let (table, series, metrics) = tokio::task::spawn_blocking(move || {
        let model = kind.build();
        let names: Vec<String> = FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect();
        WalkForwardEngine::run(&table, &names, &engine_config, &*model)
            .map(|(series, metrics)| (table, series, metrics))
    })
    .await
    .context("Walk-forward task panicked")?
    .with_context(|| format!("Walk-forward failed for {symbol}"))?;

    let auc = prediction_auc(&series);
    let artifact_dir = request.out_dir.join(symbol);
    save_artifacts(&artifact_dir, &series, &metrics, auc)?;

    let report = BacktestReport {
        symbol: symbol.to_string(),
        model: kind,
        period: request.period,
        n_samples: table.len(),
        n_predictions: series.len(),
        metrics,
        auc,
        first_date: series.records.first().map(|r| r.date),
        last_date: series.records.last().map(|r| r.date),
        final_equity: series.records.last().map(|r| r.equity).unwrap_or(1.0),
        run_hash: run_hash(symbol, kind, request.period, &config),
        config,
        artifact_dir,
    };
    save_report(&report.artifact_dir, &report)?;

    if let Some(pool) = db {
        if let Err(e) = record_run(pool, &report).await {
            warn!(symbol = %symbol, error = %format!("{e:#}"), "Failed to store run record");
        }
    }

    Ok(report)
}

/// AUC of the emitted probabilities against the realized direction
fn prediction_auc(series: &PredictionSeries) -> f64 {
    let labels: Vec<u8> = series
        .records
        .iter()
        .map(|r| u8::from(r.forward_return > 0.0))
        .collect();
    evaluate_auc(&labels, &series.probabilities())
}

async fn record_run(pool: &SqlitePool, report: &BacktestReport) -> Result<()> {
    let record = BacktestRunRecord {
        id: None,
        run_hash: report.run_hash.clone(),
        symbol: report.symbol.clone(),
        model: report.model.to_string(),
        period: report.period.to_string(),
        config_json: serde_json::to_string(&report.config)?,
        n_samples: report.n_samples as i64,
        n_predictions: report.n_predictions as i64,
        sharpe: defined(report.metrics.sharpe),
        cagr: defined(report.metrics.cagr),
        max_drawdown: defined(report.metrics.max_drawdown),
        win_rate: defined(report.metrics.win_rate),
        auc: defined(report.auc),
        first_date: report.first_date.map(|d| d.to_string()),
        last_date: report.last_date.map(|d| d.to_string()),
        artifact_dir: Some(report.artifact_dir.display().to_string()),
        created_at: None,
    };
    RunRepository::new(pool).save(&record).await?;
    Ok(())
}
