//! Structured lifecycle events for active-learning runs.
//!
//! Every event carries an `event = "..."` field so log pipelines can filter on
//! it. Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use crate::pool::ExclusionReason;
use tracing::{info, warn};

/// RAII guard that enters a run-scoped span for the duration of a run.
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // events below carry run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("qal.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, strategy: &str, labeled: usize, unlabeled: usize) {
    info!(
        event = "loop.run_started",
        run_id = %run_id,
        strategy = %strategy,
        labeled = labeled,
        unlabeled = unlabeled,
    );
}

/// Phase entered by the controller.
pub fn emit_phase(iteration: u64, phase: &str) {
    tracing::debug!(event = "loop.phase", iteration = iteration, phase = %phase);
}

pub fn emit_round_recorded(
    iteration: u64,
    labeled: usize,
    unlabeled: usize,
    rmse: f64,
    completed: usize,
    queued: usize,
) {
    info!(
        event = "loop.round_recorded",
        iteration = iteration,
        labeled = labeled,
        unlabeled = unlabeled,
        rmse = rmse,
        completed = completed,
        queued = queued,
    );
}

pub fn emit_oracle_submitted(request_id: &str, candidate_id: &str, attempt: u32) {
    info!(
        event = "oracle.submitted",
        request_id = %request_id,
        candidate_id = %candidate_id,
        attempt = attempt,
    );
}

/// Oracle result discarded because its fingerprint did not match (warning level).
pub fn emit_integrity_mismatch(request_id: &str, expected: &str, actual: &str) {
    warn!(
        event = "oracle.integrity_mismatch",
        request_id = %request_id,
        expected = %expected,
        actual = %actual,
    );
}

pub fn emit_candidate_excluded(candidate_id: &str, reason: &ExclusionReason) {
    warn!(
        event = "pool.candidate_excluded",
        candidate_id = %candidate_id,
        reason = %reason,
    );
}

pub fn emit_run_finished(
    run_id: &str,
    termination: &str,
    iterations: u64,
    cumulative_labels: usize,
    final_rmse: Option<f64>,
) {
    info!(
        event = "loop.run_finished",
        run_id = %run_id,
        termination = %termination,
        iterations = iterations,
        cumulative_labels = cumulative_labels,
        final_rmse = ?final_rmse,
    );
}

pub fn emit_run_aborted(run_id: &str, phase: &str, error: &dyn std::fmt::Display) {
    tracing::error!(event = "loop.run_aborted", run_id = %run_id, phase = %phase, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_phase(0, "fitting");
    }
}
