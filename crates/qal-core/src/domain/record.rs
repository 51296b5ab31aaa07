//! Per-round records and the run summary.

use crate::acquisition::StrategyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics captured at the end of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Round index, starting at 0 and increasing by 1.
    pub iteration: u64,

    /// Size of the labeled set after the round.
    pub labeled: usize,

    /// Size of the unlabeled pool after the round.
    pub unlabeled: usize,

    /// RMSE on the held-out evaluation slice, measured with the model fitted this round.
    pub rmse: f64,

    /// Mean predicted std over the scored pool.
    pub mean_std: f64,

    /// Mean predicted std over the dispatched batch (0 when nothing was dispatched).
    pub selected_mean_std: f64,

    /// Requests submitted this round.
    pub dispatched: usize,

    /// Requests that completed with a valid fingerprint this round.
    pub completed: usize,

    /// Requests still queued or pending at the end of the round.
    pub queued: usize,

    /// Requests that failed this round (including integrity mismatches).
    pub failed: usize,

    /// Subset of `failed` caused by fingerprint mismatches.
    pub integrity_failures: usize,

    pub recorded_at: DateTime<Utc>,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxIterations,
    PoolExhausted,
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::MaxIterations => write!(f, "max_iterations"),
            TerminationReason::PoolExhausted => write!(f, "pool_exhausted"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate statistics over a finished run. Computed once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub strategy: StrategyKind,
    pub iterations_completed: u64,
    pub termination: TerminationReason,
    pub rmse_history: Vec<f64>,
    pub final_rmse: Option<f64>,

    /// Total labels held at the end of the run (seed + acquired).
    pub cumulative_labels: usize,
    pub seed_labels: usize,
    pub acquired_labels: usize,

    /// Labels held when `target_rmse` was first reached, if configured and reached.
    pub labels_to_target: Option<usize>,
    pub target_rmse: Option<f64>,
    pub baseline_label_budget: usize,

    /// `(baseline - labels_consumed) / baseline`; negative when the run used more labels.
    pub label_efficiency_gain: f64,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
