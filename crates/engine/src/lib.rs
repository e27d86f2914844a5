//! Walk-forward backtesting engine for a next-day direction signal
//!
//! Provides:
//! - Feature/label construction from daily klines
//! - Classifier adapters (logistic regression, boosted stumps)
//! - The walk-forward engine and its performance metrics
//! - Binance daily data client, artifact export and the per-symbol pipeline

pub mod api;
pub mod artifacts;
pub mod data;
pub mod engine;
pub mod features;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod types;

// Re-exports for convenience
pub use api::BinanceClient;
pub use artifacts::{save_artifacts, save_report};
pub use data::{fetch_prices, HistoryPeriod, PriceSource, RetryPolicy};
pub use engine::{
    EngineError, Position, PredictionSeries, StepRecord, WalkForwardConfig, WalkForwardEngine,
};
pub use features::{make_features, FEATURE_COLUMNS};
pub use metrics::{compute_metrics, evaluate_auc, SummaryMetrics};
pub use models::{BoostedStumpsModel, FnModel, LogisticModel, ModelAdapter, ModelError, ModelKind};
pub use pipeline::{
    run_pipeline, run_pipeline_with_retry, BacktestReport, PipelineRequest, SymbolOutcome,
    MIN_TRAIN_FLOOR,
};
pub use types::*;
