//! Performance metrics over a strategy return series
//!
//! Everything here works on bare `f64` slices: no dates, positions or
//! features. Undefined results are reported as `f64::NAN`, never as errors.

use serde::{Deserialize, Serialize};

/// Trading periods per year used for annualization
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Undefined (non-finite) values travel as JSON `null`
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        value.is_finite().then_some(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Summary statistics of one completed return series
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SummaryMetrics {
    /// mean / sample stdev × sqrt(252)
    #[serde(with = "nan_as_null")]
    pub sharpe: f64,
    /// Compound annual growth rate
    #[serde(with = "nan_as_null")]
    pub cagr: f64,
    /// Worst peak-to-trough decline of the equity curve (≤ 0)
    #[serde(with = "nan_as_null")]
    pub max_drawdown: f64,
    /// Fraction of periods with a strictly positive return
    #[serde(with = "nan_as_null")]
    pub win_rate: f64,
}

impl SummaryMetrics {
    pub fn undefined() -> Self {
        Self {
            sharpe: f64::NAN,
            cagr: f64::NAN,
            max_drawdown: f64::NAN,
            win_rate: f64::NAN,
        }
    }
}

/// Compute all four summary metrics. NaN entries are discarded first.
pub fn compute_metrics(strategy_returns: &[f64]) -> SummaryMetrics {
    let returns: Vec<f64> = strategy_returns
        .iter()
        .copied()
        .filter(|r| !r.is_nan())
        .collect();

    if returns.is_empty() {
        return SummaryMetrics::undefined();
    }

    let equity = equity_curve(&returns);

    SummaryMetrics {
        sharpe: sharpe_ratio(&returns),
        cagr: cagr(&equity),
        max_drawdown: max_drawdown(&equity),
        win_rate: win_rate(&returns),
    }
}

/// Cumulative compounded equity starting from 1: `equity[t] = equity[t-1] × (1 + r[t])`
pub fn equity_curve(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(1.0, |equity, r| {
            *equity *= 1.0 + r;
            Some(*equity)
        })
        .collect()
}

/// `equity[t] / running_max(equity[..=t]) - 1` for every point
pub fn drawdown_curve(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    equity
        .iter()
        .map(|&e| {
            peak = peak.max(e);
            e / peak - 1.0
        })
        .collect()
}

pub fn max_drawdown(equity: &[f64]) -> f64 {
    if equity.is_empty() {
        return f64::NAN;
    }
    drawdown_curve(equity)
        .into_iter()
        .fold(0.0, f64::min)
}

pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return f64::NAN;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev > 0.0 {
        mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        f64::NAN
    }
}

/// CAGR from a compounded equity curve with one point per period
pub fn cagr(equity: &[f64]) -> f64 {
    let Some(&final_equity) = equity.last() else {
        return f64::NAN;
    };
    let years = equity.len() as f64 / TRADING_DAYS_PER_YEAR;
    if years <= 0.0 || final_equity <= 0.0 {
        return f64::NAN;
    }
    final_equity.powf(1.0 / years) - 1.0
}

pub fn win_rate(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return f64::NAN;
    }
    returns.iter().filter(|&&r| r > 0.0).count() as f64 / returns.len() as f64
}

/// ROC AUC of probabilities against binary labels (Mann–Whitney U with
/// average ranks for ties). NaN when either class is absent.
pub fn evaluate_auc(labels: &[u8], probabilities: &[f64]) -> f64 {
    if labels.len() != probabilities.len() || labels.is_empty() {
        return f64::NAN;
    }

    let positives = labels.iter().filter(|&&y| y == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|&a, &b| probabilities[a].total_cmp(&probabilities[b]));

    let mut ranks = vec![0.0; order.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && probabilities[order[end]] == probabilities[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1..=end share their mean
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg_rank;
        }
        start = end;
    }

    let positive_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(&y, _)| y == 1)
        .map(|(_, &r)| r)
        .sum();

    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    u / (p * negatives as f64)
}
