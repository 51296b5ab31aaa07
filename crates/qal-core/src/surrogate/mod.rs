//! Surrogate models: cheap regressors that stand in for the oracle.
//!
//! A model is refit from scratch on the full labeled set every round and is
//! never queried while fitting; the controller's phase ordering guarantees
//! both.

mod gp;

pub use gp::GaussianProcess;

use crate::domain::{Candidate, LabeledExample, SurrogateError};
use serde::{Deserialize, Serialize};

/// Point prediction with uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub mean: f64,
    /// Predictive standard deviation, always `>= 0`.
    pub std: f64,
}

/// A regression model retrainable on the current labeled set.
pub trait SurrogateModel: Send {
    /// Fit on `examples`, discarding any previous fit.
    ///
    /// Fails with `InsufficientData` when fewer than the configured minimum
    /// number of examples is supplied.
    fn fit(&mut self, examples: &[LabeledExample]) -> Result<(), SurrogateError>;

    /// Predict mean and std for each candidate, in input order.
    ///
    /// Fails with `NotFitted` before the first successful `fit`.
    fn predict(&self, candidates: &[&Candidate]) -> Result<Vec<Prediction>, SurrogateError>;

    /// Short model name for logs and reports.
    fn name(&self) -> &'static str;
}

/// Root-mean-square error of `predictions` against `labels`.
pub fn rmse(predictions: &[Prediction], labels: &[f64]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let sum: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(p, y)| (p.mean - y).powi(2))
        .sum();
    (sum / predictions.len() as f64).sqrt()
}
