//! Gaussian-process regression with an RBF kernel and white noise.

use super::{Prediction, SurrogateModel};
use crate::config::SurrogateConfig;
use crate::domain::{Candidate, LabeledExample, SurrogateError};
use tracing::debug;

const MAX_JITTER_ATTEMPTS: usize = 6;

#[derive(Debug, Clone)]
struct FittedGp {
    train: Vec<Vec<f64>>,
    feature_mean: Vec<f64>,
    feature_scale: Vec<f64>,
    label_mean: f64,
    chol: Vec<Vec<f64>>,
    alpha: Vec<f64>,
}

/// Exact GP regressor.
///
/// Features are standardised with training statistics and labels are
/// centred, so `length_scale` is measured in standard deviations.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    config: SurrogateConfig,
    min_examples: usize,
    fitted: Option<FittedGp>,
}

impl GaussianProcess {
    pub fn new(config: SurrogateConfig, min_examples: usize) -> Self {
        Self {
            config,
            min_examples,
            fitted: None,
        }
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        self.config.signal_variance * (-0.5 * sq / self.config.length_scale.powi(2)).exp()
    }
}

fn standardize(x: &[f64], mean: &[f64], scale: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(mean.iter().zip(scale))
        .map(|(v, (m, s))| (v - m) / s)
        .collect()
}

fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

/// Solve `L y = b`.
fn forward_substitute(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; b.len()];
    for i in 0..b.len() {
        let sum: f64 = (0..i).map(|k| l[i][k] * y[k]).sum();
        y[i] = (b[i] - sum) / l[i][i];
    }
    y
}

/// Solve `Lᵀ x = y`.
fn backward_substitute(l: &[Vec<f64>], y: &[f64]) -> Vec<f64> {
    let n = y.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (y[i] - sum) / l[i][i];
    }
    x
}

impl SurrogateModel for GaussianProcess {
    fn fit(&mut self, examples: &[LabeledExample]) -> Result<(), SurrogateError> {
        self.fitted = None;
        let min = self.min_examples.max(1);
        if examples.len() < min {
            return Err(SurrogateError::InsufficientData {
                got: examples.len(),
                min,
            });
        }

        let dim = examples[0].candidate.dim();
        if let Some(bad) = examples.iter().find(|ex| ex.candidate.dim() != dim) {
            return Err(SurrogateError::DimensionMismatch {
                expected: dim,
                actual: bad.candidate.dim(),
            });
        }

        let n = examples.len() as f64;
        let mut feature_mean = vec![0.0; dim];
        for ex in examples {
            for (m, v) in feature_mean.iter_mut().zip(ex.candidate.features()) {
                *m += v / n;
            }
        }
        let mut feature_scale = vec![0.0; dim];
        for ex in examples {
            for ((s, v), m) in feature_scale
                .iter_mut()
                .zip(ex.candidate.features())
                .zip(&feature_mean)
            {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in feature_scale.iter_mut() {
            *s = if *s > 1e-24 { s.sqrt() } else { 1.0 };
        }

        let train: Vec<Vec<f64>> = examples
            .iter()
            .map(|ex| standardize(ex.candidate.features(), &feature_mean, &feature_scale))
            .collect();
        let label_mean = examples.iter().map(|ex| ex.label).sum::<f64>() / n;
        let centred: Vec<f64> = examples.iter().map(|ex| ex.label - label_mean).collect();

        let size = train.len();
        let mut gram = vec![vec![0.0; size]; size];
        for i in 0..size {
            for j in 0..=i {
                let k = self.kernel(&train[i], &train[j]);
                gram[i][j] = k;
                gram[j][i] = k;
            }
        }

        let mut jitter = 0.0;
        let mut chol = None;
        for attempt in 0..MAX_JITTER_ATTEMPTS {
            let mut shifted = gram.clone();
            for (i, row) in shifted.iter_mut().enumerate() {
                row[i] += self.config.noise + jitter;
            }
            if let Some(l) = cholesky(&shifted) {
                chol = Some(l);
                break;
            }
            jitter = if attempt == 0 {
                1e-10 * self.config.signal_variance
            } else {
                jitter * 10.0
            };
            debug!(attempt, jitter, "gram matrix not positive definite, retrying with jitter");
        }
        let chol = chol.ok_or_else(|| {
            SurrogateError::Numerical("cholesky decomposition failed".to_string())
        })?;

        let alpha = backward_substitute(&chol, &forward_substitute(&chol, &centred));

        self.fitted = Some(FittedGp {
            train,
            feature_mean,
            feature_scale,
            label_mean,
            chol,
            alpha,
        });
        Ok(())
    }

    fn predict(&self, candidates: &[&Candidate]) -> Result<Vec<Prediction>, SurrogateError> {
        let fitted = self.fitted.as_ref().ok_or(SurrogateError::NotFitted)?;
        let dim = fitted.feature_mean.len();

        candidates
            .iter()
            .map(|candidate| {
                if candidate.dim() != dim {
                    return Err(SurrogateError::DimensionMismatch {
                        expected: dim,
                        actual: candidate.dim(),
                    });
                }
                let x = standardize(
                    candidate.features(),
                    &fitted.feature_mean,
                    &fitted.feature_scale,
                );
                let k_star: Vec<f64> = fitted.train.iter().map(|t| self.kernel(t, &x)).collect();
                let mean = fitted.label_mean
                    + k_star
                        .iter()
                        .zip(&fitted.alpha)
                        .map(|(k, a)| k * a)
                        .sum::<f64>();
                let v = forward_substitute(&fitted.chol, &k_star);
                let variance = self.config.signal_variance - v.iter().map(|x| x * x).sum::<f64>();
                Ok(Prediction {
                    mean,
                    std: variance.max(0.0).sqrt(),
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "gaussian_process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Origin;

    fn example(id: usize, x: f64, y: f64) -> LabeledExample {
        LabeledExample {
            candidate: Candidate::new(format!("c{}", id), vec![x]),
            label: y,
            origin: Origin::Seed,
        }
    }

    fn sine_examples(n: usize) -> Vec<LabeledExample> {
        (0..n)
            .map(|i| {
                let x = i as f64 / n as f64 * 6.0;
                example(i, x, x.sin())
            })
            .collect()
    }

    fn model() -> GaussianProcess {
        GaussianProcess::new(SurrogateConfig::default(), 3)
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let gp = model();
        let c = Candidate::new("x", vec![0.0]);
        let err = gp.predict(&[&c]).expect_err("not fitted");
        assert!(matches!(err, SurrogateError::NotFitted));
    }

    #[test]
    fn test_fit_requires_minimum_examples() {
        let mut gp = model();
        let err = gp.fit(&sine_examples(2)).expect_err("too few");
        assert!(matches!(
            err,
            SurrogateError::InsufficientData { got: 2, min: 3 }
        ));
    }

    #[test]
    fn test_interpolates_training_points() {
        let mut gp = model();
        let examples = sine_examples(20);
        gp.fit(&examples).expect("fit");
        let candidates: Vec<&Candidate> = examples.iter().map(|e| &e.candidate).collect();
        let preds = gp.predict(&candidates).expect("predict");
        for (pred, ex) in preds.iter().zip(&examples) {
            assert!((pred.mean - ex.label).abs() < 1e-2, "{:?} vs {}", pred, ex.label);
            assert!(pred.std < 1e-2);
        }
    }

    #[test]
    fn test_uncertainty_grows_away_from_data() {
        let mut gp = model();
        gp.fit(&sine_examples(10)).expect("fit");
        let near = Candidate::new("near", vec![3.0]);
        let far = Candidate::new("far", vec![60.0]);
        let preds = gp.predict(&[&near, &far]).expect("predict");
        assert!(preds[1].std > preds[0].std);
        assert!((preds[1].std - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_training_points_are_stable() {
        let mut gp = model();
        let examples = vec![
            example(0, 1.0, 0.5),
            example(1, 1.0, 0.5),
            example(2, 2.0, 1.0),
            example(3, 3.0, 0.2),
        ];
        gp.fit(&examples).expect("fit");
        let c = Candidate::new("q", vec![1.0]);
        let preds = gp.predict(&[&c]).expect("predict");
        assert!(preds[0].std >= 0.0);
        assert!(preds[0].mean.is_finite());
    }

    #[test]
    fn test_dimension_mismatch_on_predict() {
        let mut gp = model();
        gp.fit(&sine_examples(5)).expect("fit");
        let c = Candidate::new("wide", vec![1.0, 2.0]);
        assert!(matches!(
            gp.predict(&[&c]),
            Err(SurrogateError::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_refit_replaces_previous_fit() {
        let mut gp = model();
        gp.fit(&sine_examples(10)).expect("fit");
        assert!(gp.fit(&sine_examples(1)).is_err());
        let c = Candidate::new("x", vec![0.0]);
        assert!(matches!(gp.predict(&[&c]), Err(SurrogateError::NotFitted)));
    }
}
