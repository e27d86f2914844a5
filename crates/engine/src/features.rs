//! Technical features and next-day labels from daily klines
//!
//! Indicators run bar-by-bar through the `ta` crate. Rows inside the longest
//! indicator warm-up are dropped, as is the last bar (its forward return is
//! not yet known) and any row holding a non-finite value.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ndarray::Array2;
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, FastStochastic, MovingAverageConvergenceDivergence,
    SimpleMovingAverage, StandardDeviation,
};
use ta::{DataItem, Next};
use tracing::debug;

use crate::types::{FeatureTable, Kline};

pub const FEATURE_COLUMNS: [&str; 15] = [
    "ret_1d",
    "log_ret_1d",
    "ret_5d",
    "ret_21d",
    "roll_mean_5",
    "roll_mean_21",
    "roll_std_21",
    "rsi_14",
    "macd",
    "macd_signal",
    "stoch_k",
    "stoch_d",
    "bb_high",
    "bb_low",
    "bb_width",
];

/// First row where every column is defined: the MACD signal needs the 26-bar
/// slow EMA (index 25) plus 8 more bars
pub const WARMUP_BARS: usize = 33;

const RSI_PERIOD: usize = 14;
const STD_WINDOW: usize = 21;

/// EMA period whose 2 / (n + 1) weight equals Wilder's 1 / RSI_PERIOD
const WILDER_EMA_PERIOD: usize = 2 * RSI_PERIOD - 1;

fn indicator<T, E: std::fmt::Debug>(built: Result<T, E>, name: &str) -> Result<T> {
    built.map_err(|e| anyhow::anyhow!("Invalid {name} parameters: {e:?}"))
}

/// Streaming indicator state for one symbol
struct IndicatorSet {
    sma_5: SimpleMovingAverage,
    sma_21: SimpleMovingAverage,
    std_21: StandardDeviation,
    rsi_gain: ExponentialMovingAverage,
    rsi_loss: ExponentialMovingAverage,
    macd: MovingAverageConvergenceDivergence,
    stoch: FastStochastic,
    stoch_signal: SimpleMovingAverage,
    bb: BollingerBands,
}

impl IndicatorSet {
    fn new() -> Result<Self> {
        Ok(Self {
            sma_5: indicator(SimpleMovingAverage::new(5), "SMA(5)")?,
            sma_21: indicator(SimpleMovingAverage::new(21), "SMA(21)")?,
            std_21: indicator(StandardDeviation::new(STD_WINDOW), "SD(21)")?,
            rsi_gain: indicator(ExponentialMovingAverage::new(WILDER_EMA_PERIOD), "RSI gain EMA")?,
            rsi_loss: indicator(ExponentialMovingAverage::new(WILDER_EMA_PERIOD), "RSI loss EMA")?,
            macd: indicator(MovingAverageConvergenceDivergence::new(12, 26, 9), "MACD")?,
            stoch: indicator(FastStochastic::new(14), "Stochastic(14)")?,
            stoch_signal: indicator(SimpleMovingAverage::new(3), "SMA(3)")?,
            bb: indicator(BollingerBands::new(20, 2.0), "BB(20, 2)")?,
        })
    }

    /// RSI with Wilder smoothing of gains and losses, seeded at the first change
    fn wilder_rsi(&mut self, closes: &[f64]) -> f64 {
        let t = closes.len() - 1;
        if t == 0 {
            return f64::NAN;
        }
        let change = closes[t] - closes[t - 1];
        let gain = self.rsi_gain.next(change.max(0.0));
        let loss = self.rsi_loss.next((-change).max(0.0));
        if t < RSI_PERIOD {
            f64::NAN
        } else if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    }

    /// Feed one bar; `closes` holds every close up to and including this bar
    fn next(&mut self, bar: &DataItem, closes: &[f64]) -> [f64; 15] {
        let t = closes.len() - 1;
        let close = closes[t];
        let pct = |lag: usize| {
            if t >= lag {
                close / closes[t - lag] - 1.0
            } else {
                f64::NAN
            }
        };

        let ret_1d = pct(1);
        let sma_5 = self.sma_5.next(close);
        let sma_21 = self.sma_21.next(close);
        // ta reports the population deviation; rescale to the sample (n - 1) one
        let std_21 = self.std_21.next(close) * (STD_WINDOW as f64 / (STD_WINDOW - 1) as f64).sqrt();
        let rsi = self.wilder_rsi(closes);
        let macd = self.macd.next(close);
        let stoch_k = self.stoch.next(bar);
        let stoch_d = self.stoch_signal.next(stoch_k);
        let bb = self.bb.next(close);

        [
            ret_1d,
            ret_1d.ln_1p(),
            pct(5),
            pct(21),
            sma_5 / close - 1.0,
            sma_21 / close - 1.0,
            std_21,
            rsi,
            macd.macd,
            macd.signal,
            stoch_k,
            stoch_d,
            bb.upper / close - 1.0,
            bb.lower / close - 1.0,
            (bb.upper - bb.lower) / close,
        ]
    }
}

/// Sort by open time and keep one kline per calendar date (the last seen)
pub fn normalize_klines(klines: &[Kline]) -> Vec<(NaiveDate, Kline)> {
    let mut dated: Vec<(NaiveDate, Kline)> = klines
        .iter()
        .filter_map(|k| k.date().map(|d| (d, k.clone())))
        .collect();
    dated.sort_by_key(|(d, k)| (*d, k.open_time));

    let mut out: Vec<(NaiveDate, Kline)> = Vec::with_capacity(dated.len());
    for (date, kline) in dated {
        match out.last_mut() {
            Some((last, slot)) if *last == date => *slot = kline,
            _ => out.push((date, kline)),
        }
    }
    out
}

/// Compute the feature table (features, labels, forward returns) for one symbol
pub fn make_features(klines: &[Kline]) -> Result<FeatureTable> {
    let bars = normalize_klines(klines);
    let mut indicators = IndicatorSet::new()?;

    let mut closes: Vec<f64> = Vec::with_capacity(bars.len());
    let mut dates = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    let mut forward_returns = Vec::new();
    let mut dropped_non_finite = 0usize;

    for (t, (date, kline)) in bars.iter().enumerate() {
        let close = kline.close_f64();
        closes.push(close);

        let item = DataItem::builder()
            .open(close)
            .high(kline.high_f64().max(close))
            .low(kline.low_f64().min(close))
            .close(close)
            .volume(0.0)
            .build();
        let Ok(item) = item else {
            // A bar ta refuses (e.g. NaN prices) is skipped, not fed to the indicators
            dropped_non_finite += 1;
            continue;
        };

        let row = indicators.next(&item, &closes);

        let Some((_, next_kline)) = bars.get(t + 1) else { break };
        if t < WARMUP_BARS {
            continue;
        }

        let forward = next_kline.close_f64() / close - 1.0;
        if !forward.is_finite() || row.iter().any(|v| !v.is_finite()) {
            dropped_non_finite += 1;
            continue;
        }

        dates.push(*date);
        values.extend_from_slice(&row);
        forward_returns.push(forward);
    }

    debug!(
        klines = klines.len(),
        rows = dates.len(),
        dropped_non_finite,
        "Features computed"
    );

    let n_rows = dates.len();
    let matrix = Array2::from_shape_vec((n_rows, FEATURE_COLUMNS.len()), values)
        .context("Feature matrix shape")?;
    let names = FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect();

    FeatureTable::new(dates, names, matrix, forward_returns).context("Invalid feature table")
}
