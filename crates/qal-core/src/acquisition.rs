//! Acquisition strategies: turn surrogate predictions into a ranked batch.
//!
//! Scores are ephemeral and recomputed every round. Batch selection sorts by
//! score descending and breaks ties by ascending candidate id, so the same
//! scores always produce the same batch.

use crate::domain::{AcquisitionError, Candidate, CandidateId};
use crate::surrogate::Prediction;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::collections::BTreeMap;

/// Which acquisition policy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    #[default]
    Uncertainty,
    ExpectedImprovement,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Random => write!(f, "random"),
            StrategyKind::Uncertainty => write!(f, "uncertainty"),
            StrategyKind::ExpectedImprovement => write!(f, "expected_improvement"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(StrategyKind::Random),
            "uncertainty" => Ok(StrategyKind::Uncertainty),
            "expected_improvement" | "expected-improvement" | "ei" => {
                Ok(StrategyKind::ExpectedImprovement)
            }
            other => Err(format!("unknown acquisition strategy: {}", other)),
        }
    }
}

/// Whether larger or smaller labels are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Maximize,
    Minimize,
}

/// Per-round inputs to scoring beyond the predictions themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringContext {
    pub iteration: u64,
    /// Run seed; combined with `iteration` for the random strategy.
    pub seed: u64,
    /// Best label observed so far, if any.
    pub incumbent: Option<f64>,
    pub objective: Objective,
    /// Exploration margin for expected improvement.
    pub xi: f64,
}

/// One candidate's score for one round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcquisitionScore {
    pub mean: f64,
    pub std: f64,
    pub score: f64,
}

/// A scoring policy.
pub trait AcquisitionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Score every candidate. `predictions[i]` belongs to `candidates[i]`.
    fn score(
        &self,
        candidates: &[&Candidate],
        predictions: &[Prediction],
        context: &ScoringContext,
    ) -> BTreeMap<CandidateId, AcquisitionScore>;
}

/// Uniform scores from a seeded generator; top-k of these is a uniform draw
/// without replacement.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

/// Score is the predicted standard deviation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UncertaintyStrategy;

/// Expected improvement over the incumbent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpectedImprovementStrategy;

/// Build the strategy for `kind`.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn AcquisitionStrategy> {
    match kind {
        StrategyKind::Random => Box::new(RandomStrategy),
        StrategyKind::Uncertainty => Box::new(UncertaintyStrategy),
        StrategyKind::ExpectedImprovement => Box::new(ExpectedImprovementStrategy),
    }
}

fn round_seed(seed: u64, iteration: u64) -> u64 {
    seed ^ iteration.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

impl AcquisitionStrategy for RandomStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Random
    }

    fn score(
        &self,
        candidates: &[&Candidate],
        predictions: &[Prediction],
        context: &ScoringContext,
    ) -> BTreeMap<CandidateId, AcquisitionScore> {
        // Draw in id order so the result does not depend on input order.
        let mut indexed: Vec<(&Candidate, &Prediction)> =
            candidates.iter().copied().zip(predictions).collect();
        indexed.sort_by(|a, b| a.0.id().cmp(b.0.id()));

        let mut rng = StdRng::seed_from_u64(round_seed(context.seed, context.iteration));
        indexed
            .into_iter()
            .map(|(candidate, p)| {
                let score = rng.gen::<f64>();
                (
                    candidate.id().clone(),
                    AcquisitionScore {
                        mean: p.mean,
                        std: p.std,
                        score,
                    },
                )
            })
            .collect()
    }
}

impl AcquisitionStrategy for UncertaintyStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Uncertainty
    }

    fn score(
        &self,
        candidates: &[&Candidate],
        predictions: &[Prediction],
        _context: &ScoringContext,
    ) -> BTreeMap<CandidateId, AcquisitionScore> {
        candidates
            .iter()
            .zip(predictions)
            .map(|(candidate, p)| {
                (
                    candidate.id().clone(),
                    AcquisitionScore {
                        mean: p.mean,
                        std: p.std,
                        score: p.std,
                    },
                )
            })
            .collect()
    }
}

/// EI for a single prediction.
///
/// With `delta = mean - best - xi` (negated for minimisation),
/// `EI = delta * Φ(delta / std) + std * φ(delta / std)`; `std = 0` gives
/// `max(delta, 0)`.
pub fn expected_improvement(
    prediction: &Prediction,
    incumbent: f64,
    objective: Objective,
    xi: f64,
) -> f64 {
    let delta = match objective {
        Objective::Maximize => prediction.mean - incumbent - xi,
        Objective::Minimize => incumbent - prediction.mean - xi,
    };
    if prediction.std <= 0.0 {
        return delta.max(0.0);
    }
    let normal = match Normal::new(0.0, 1.0) {
        Ok(n) => n,
        Err(_) => return delta.max(0.0),
    };
    let z = delta / prediction.std;
    (delta * normal.cdf(z) + prediction.std * normal.pdf(z)).max(0.0)
}

impl AcquisitionStrategy for ExpectedImprovementStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExpectedImprovement
    }

    fn score(
        &self,
        candidates: &[&Candidate],
        predictions: &[Prediction],
        context: &ScoringContext,
    ) -> BTreeMap<CandidateId, AcquisitionScore> {
        candidates
            .iter()
            .zip(predictions)
            .map(|(candidate, p)| {
                // No incumbent yet: fall back to pure exploration.
                let score = match context.incumbent {
                    Some(best) => expected_improvement(p, best, context.objective, context.xi),
                    None => p.std,
                };
                (
                    candidate.id().clone(),
                    AcquisitionScore {
                        mean: p.mean,
                        std: p.std,
                        score,
                    },
                )
            })
            .collect()
    }
}

/// Pick the top `batch_size` candidates.
///
/// Fails with `InsufficientPool` when fewer than `batch_size` candidates were
/// scored; the caller decides whether to shrink the batch or stop.
pub fn select_batch(
    scores: &BTreeMap<CandidateId, AcquisitionScore>,
    batch_size: usize,
) -> Result<Vec<CandidateId>, AcquisitionError> {
    if batch_size > scores.len() {
        return Err(AcquisitionError::InsufficientPool {
            requested: batch_size,
            available: scores.len(),
        });
    }
    // BTreeMap iteration is already ascending by id; a stable sort on score
    // keeps that order among ties.
    let mut ranked: Vec<(&CandidateId, f64)> =
        scores.iter().map(|(id, s)| (id, s.score)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(ranked
        .into_iter()
        .take(batch_size)
        .map(|(id, _)| id.clone())
        .collect())
}
