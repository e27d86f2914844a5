//! On-disk artifacts of a completed run

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::Writer;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;

use crate::engine::{Position, PredictionSeries};
use crate::metrics::{drawdown_curve, nan_as_null, SummaryMetrics};
use crate::pipeline::BacktestReport;

pub const PREDICTIONS_FILE: &str = "predictions.csv";
pub const METRICS_FILE: &str = "metrics.json";
pub const REPORT_FILE: &str = "report.json";

/// Contents of `metrics.json`: the summary metrics plus the prediction AUC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsFile {
    #[serde(flatten)]
    pub summary: SummaryMetrics,
    #[serde(with = "nan_as_null")]
    pub auc: f64,
}

#[derive(Serialize)]
struct PredictionRow {
    date: NaiveDate,
    probability: f64,
    position: Position,
    forward_return: f64,
    position_prev: Position,
    turnover: f64,
    cost: f64,
    strategy_return: f64,
    equity: f64,
    drawdown: f64,
}

/// Write `predictions.csv` and `metrics.json` into `dir`, creating it if needed.
/// Undefined metrics (and an undefined AUC) are written as JSON `null`.
pub fn save_artifacts(
    dir: impl AsRef<Path>,
    series: &PredictionSeries,
    metrics: &SummaryMetrics,
    auc: f64,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create artifact dir {}", dir.display()))?;

    let path = dir.join(PREDICTIONS_FILE);
    let mut writer = Writer::from_path(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let drawdowns = drawdown_curve(&series.equity_curve());
    for (rec, drawdown) in series.records.iter().zip(drawdowns) {
        writer.serialize(PredictionRow {
            date: rec.date,
            probability: rec.probability,
            position: rec.position,
            forward_return: rec.forward_return,
            position_prev: rec.position_prev,
            turnover: rec.turnover,
            cost: rec.cost,
            strategy_return: rec.strategy_return,
            equity: rec.equity,
            drawdown,
        })?;
    }
    if series.is_empty() {
        // No rows means serialize never emitted the header
        writer.write_record([
            "date",
            "probability",
            "position",
            "forward_return",
            "position_prev",
            "turnover",
            "cost",
            "strategy_return",
            "equity",
            "drawdown",
        ])?;
    }
    writer.flush()?;

    let file = MetricsFile {
        summary: *metrics,
        auc,
    };
    save_json(&file, dir.join(METRICS_FILE))
}

/// Write `report.json` into `dir`
pub fn save_report(dir: impl AsRef<Path>, report: &BacktestReport) -> Result<()> {
    save_json(report, dir.as_ref().join(REPORT_FILE))
}

fn save_json<T: Serialize>(data: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, data)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
