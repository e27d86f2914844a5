//! Classifier adapters for the walk-forward engine
//!
//! Every classifier is reached through `ModelAdapter::fit_predict`: fit on
//! the training window, return P(up) for exactly one evaluation row. No
//! state is carried between calls, so each step is a fresh fit.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Training set is empty")]
    EmptyTrainingSet,

    #[error("Dimension mismatch: expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Label count {labels} does not match {rows} training rows")]
    LabelMismatch { rows: usize, labels: usize },

    #[error("Fit diverged (non-finite parameters)")]
    Diverged,

    #[error("{0}")]
    Failed(String),
}

/// Uniform fit/predict contract over any classifier family
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Fit on `train_x`/`train_y` and return P(label = 1) for `eval_x`
    fn fit_predict(
        &self,
        train_x: ArrayView2<'_, f64>,
        train_y: &[u8],
        eval_x: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelError>;
}

impl<M: ModelAdapter + ?Sized> ModelAdapter for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fit_predict(
        &self,
        train_x: ArrayView2<'_, f64>,
        train_y: &[u8],
        eval_x: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelError> {
        (**self).fit_predict(train_x, train_y, eval_x)
    }
}

fn check_inputs(
    train_x: &ArrayView2<'_, f64>,
    train_y: &[u8],
    eval_x: &ArrayView1<'_, f64>,
) -> Result<(), ModelError> {
    if train_x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if train_x.nrows() != train_y.len() {
        return Err(ModelError::LabelMismatch {
            rows: train_x.nrows(),
            labels: train_y.len(),
        });
    }
    if train_x.ncols() != eval_x.len() {
        return Err(ModelError::DimensionMismatch {
            expected: train_x.ncols(),
            got: eval_x.len(),
        });
    }
    Ok(())
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let exp_z = z.exp();
        exp_z / (1.0 + exp_z)
    }
}

// ============================================================================
// Closure adapter
// ============================================================================

/// Wraps a plain function as a model adapter
pub struct FnModel<F> {
    name: String,
    f: F,
}

impl<F> FnModel<F>
where
    F: Fn(ArrayView2<'_, f64>, &[u8], ArrayView1<'_, f64>) -> Result<f64, ModelError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ModelAdapter for FnModel<F>
where
    F: Fn(ArrayView2<'_, f64>, &[u8], ArrayView1<'_, f64>) -> Result<f64, ModelError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn fit_predict(
        &self,
        train_x: ArrayView2<'_, f64>,
        train_y: &[u8],
        eval_x: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelError> {
        (self.f)(train_x, train_y, eval_x)
    }
}

// ============================================================================
// Logistic regression
// ============================================================================

/// L2-regularised logistic regression on std-scaled (uncentred) features
#[derive(Debug, Clone)]
pub struct LogisticModel {
    /// Inverse regularisation strength
    pub c: f64,
    pub learning_rate: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for LogisticModel {
    fn default() -> Self {
        Self {
            c: 1.0,
            learning_rate: 0.1,
            max_iter: 200,
            tolerance: 1e-6,
        }
    }
}

impl ModelAdapter for LogisticModel {
    fn name(&self) -> &str {
        "linear"
    }

    fn fit_predict(
        &self,
        train_x: ArrayView2<'_, f64>,
        train_y: &[u8],
        eval_x: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelError> {
        check_inputs(&train_x, train_y, &eval_x)?;

        let n = train_x.nrows() as f64;
        let scale = train_x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let xs = &train_x / &scale;
        let y: Array1<f64> = train_y.iter().map(|&v| f64::from(v)).collect();

        let mut weights = Array1::<f64>::zeros(xs.ncols());
        let mut bias = 0.0;
        let l2 = 1.0 / (self.c * n);

        for _ in 0..self.max_iter {
            let predictions = (xs.dot(&weights) + bias).mapv(sigmoid);
            let errors = &predictions - &y;

            let grad_w = xs.t().dot(&errors) / n + &weights * l2;
            let grad_b = errors.sum() / n;

            weights.scaled_add(-self.learning_rate, &grad_w);
            bias -= self.learning_rate * grad_b;

            let grad_norm = (grad_w.dot(&grad_w) + grad_b * grad_b).sqrt();
            if grad_norm < self.tolerance {
                break;
            }
        }

        if !bias.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::Diverged);
        }

        let z = (&eval_x / &scale).dot(&weights) + bias;
        Ok(sigmoid(z))
    }
}

// ============================================================================
// Gradient-boosted stumps
// ============================================================================

/// One depth-1 tree: `x[feature] <= threshold` goes left
#[derive(Debug, Clone, Copy)]
struct Stump {
    feature: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl Stump {
    fn predict(&self, value: f64) -> f64 {
        if value <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// Second-order gradient boosting of decision stumps on log-loss
#[derive(Debug, Clone)]
pub struct BoostedStumpsModel {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_bins: usize,
    pub subsample: f64,
    /// L2 regularisation on leaf weights
    pub lambda: f64,
    pub min_child_weight: f64,
    pub seed: u64,
}

impl Default for BoostedStumpsModel {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.05,
            max_bins: 16,
            subsample: 0.9,
            lambda: 1.0,
            min_child_weight: 1.0,
            seed: 42,
        }
    }
}

impl BoostedStumpsModel {
    /// Up to `max_bins - 1` quantile cut points of one column
    fn cut_points(&self, column: ArrayView1<'_, f64>) -> Vec<f64> {
        let mut sorted: Vec<f64> = column.to_vec();
        sorted.sort_by(f64::total_cmp);
        sorted.dedup();
        if sorted.len() < 2 {
            return Vec::new();
        }

        let bins = self.max_bins.max(2);
        let mut cuts: Vec<f64> = (1..bins)
            .map(|k| sorted[(k * (sorted.len() - 1)) / bins])
            .collect();
        cuts.dedup();
        // The maximum cannot split anything off
        if cuts.last() == sorted.last() {
            cuts.pop();
        }
        cuts
    }
}

impl ModelAdapter for BoostedStumpsModel {
    fn name(&self) -> &str {
        "gbm"
    }

    fn fit_predict(
        &self,
        train_x: ArrayView2<'_, f64>,
        train_y: &[u8],
        eval_x: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelError> {
        check_inputs(&train_x, train_y, &eval_x)?;

        let n_rows = train_x.nrows();
        let n_features = train_x.ncols();
        let y: Vec<f64> = train_y.iter().map(|&v| f64::from(v)).collect();

        let prior = (y.iter().sum::<f64>() / n_rows as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_score = (prior / (1.0 - prior)).ln();

        let cuts: Vec<Vec<f64>> = train_x
            .axis_iter(Axis(1))
            .map(|col| self.cut_points(col))
            .collect();
        // bins[f][r]: index of the first cut >= x[r][f]
        let bins: Vec<Vec<usize>> = train_x
            .axis_iter(Axis(1))
            .zip(&cuts)
            .map(|(col, c)| col.iter().map(|&v| c.partition_point(|&cut| cut < v)).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut scores = vec![base_score; n_rows];
        let mut stumps: Vec<Stump> = Vec::with_capacity(self.n_estimators);

        for _ in 0..self.n_estimators {
            let mut grad = vec![0.0; n_rows];
            let mut hess = vec![0.0; n_rows];
            for r in 0..n_rows {
                if self.subsample < 1.0 && rng.gen::<f64>() >= self.subsample {
                    continue;
                }
                let p = sigmoid(scores[r]);
                grad[r] = p - y[r];
                hess[r] = p * (1.0 - p);
            }
            let g_total: f64 = grad.iter().sum();
            let h_total: f64 = hess.iter().sum();
            let parent = g_total * g_total / (h_total + self.lambda);

            let mut best: Option<(f64, Stump)> = None;
            for f in 0..n_features {
                if cuts[f].is_empty() {
                    continue;
                }
                let mut g_hist = vec![0.0; cuts[f].len() + 1];
                let mut h_hist = vec![0.0; cuts[f].len() + 1];
                for r in 0..n_rows {
                    g_hist[bins[f][r]] += grad[r];
                    h_hist[bins[f][r]] += hess[r];
                }

                let (mut g_left, mut h_left) = (0.0, 0.0);
                for (k, &threshold) in cuts[f].iter().enumerate() {
                    g_left += g_hist[k];
                    h_left += h_hist[k];
                    let g_right = g_total - g_left;
                    let h_right = h_total - h_left;
                    if h_left < self.min_child_weight || h_right < self.min_child_weight {
                        continue;
                    }
                    let gain = g_left * g_left / (h_left + self.lambda)
                        + g_right * g_right / (h_right + self.lambda)
                        - parent;
                    if best.map_or(true, |(g, _)| gain > g) {
                        best = Some((
                            gain,
                            Stump {
                                feature: f,
                                threshold,
                                left: -g_left / (h_left + self.lambda) * self.learning_rate,
                                right: -g_right / (h_right + self.lambda) * self.learning_rate,
                            },
                        ));
                    }
                }
            }

            let Some((gain, stump)) = best else { break };
            if gain <= 0.0 {
                break;
            }

            let column = train_x.column(stump.feature);
            for (score, &v) in scores.iter_mut().zip(column.iter()) {
                *score += stump.predict(v);
            }
            stumps.push(stump);
        }

        let z = base_score
            + stumps
                .iter()
                .map(|s| s.predict(eval_x[s.feature]))
                .sum::<f64>();
        if !z.is_finite() {
            return Err(ModelError::Diverged);
        }
        Ok(sigmoid(z))
    }
}

// ============================================================================
// Model selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Linear,
    #[serde(alias = "xgb")]
    Gbm,
}

impl ModelKind {
    pub fn build(&self) -> Box<dyn ModelAdapter> {
        match self {
            ModelKind::Linear => Box::new(LogisticModel::default()),
            ModelKind::Gbm => Box::new(BoostedStumpsModel::default()),
        }
    }
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Gbm
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Linear => write!(f, "linear"),
            ModelKind::Gbm => write!(f, "gbm"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" | "logistic" => Ok(ModelKind::Linear),
            "gbm" | "xgb" => Ok(ModelKind::Gbm),
            other => anyhow::bail!("Unknown model: {other} (expected linear or gbm)"),
        }
    }
}
