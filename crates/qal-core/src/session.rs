//! Wiring from a loaded dataset to a ready-to-run controller.

use crate::config::{RunContext, OracleKind};
use crate::controller::LoopController;
use crate::dataset::Dataset;
use crate::domain::{Candidate, CandidateId, QalError};
use crate::gateway::{OracleBackend, OracleGateway};
use crate::pool::{ExclusionReason, PoolStore};
use crate::simulated::SimulatedOracle;
use crate::surrogate::GaussianProcess;
use std::collections::HashMap;
use std::sync::Arc;

/// Seeded pool plus the evaluation slice and any known labels.
#[derive(Debug)]
pub struct PreparedRun {
    pub pool: PoolStore,
    pub eval: Vec<(Candidate, f64)>,
    pub truth: HashMap<CandidateId, f64>,
}

/// Filter, split and seed a dataset according to the run configuration.
pub fn prepare_run(ctx: &RunContext, dataset: Dataset) -> Result<PreparedRun, QalError> {
    let run = &ctx.config.run;
    let dataset = match &ctx.config.constraints {
        Some(rules) => dataset.filter(rules),
        None => dataset,
    };
    let dataset = match ctx.config.oracle.kind {
        OracleKind::Simulated => {
            dataset.require_labels("simulated oracle has no ground truth for this row")
        }
        OracleKind::Handoff => dataset,
    };
    let split = dataset.split(run.eval_size, run.seed_size, ctx.seed)?;

    let mut pool = PoolStore::new(split.pool);
    for exclusion in split.excluded {
        pool.record_exclusion(exclusion);
    }
    pool.seed(&split.seed_ids, &split.seed_labels)?;

    Ok(PreparedRun {
        pool,
        eval: split.eval,
        truth: split.truth,
    })
}

/// The in-memory backend configured by `[oracle]`.
pub fn simulated_backend(ctx: &RunContext, truth: HashMap<CandidateId, f64>) -> SimulatedOracle {
    let oracle = &ctx.config.oracle;
    SimulatedOracle::new(truth)
        .with_completion_polls(oracle.completion_polls)
        .with_failure_rate(oracle.failure_rate, ctx.seed)
}

/// Build a controller with the Gaussian-process surrogate.
///
/// `backend` is required for `handoff` runs; `simulated` runs build their own
/// from the dataset labels when it is `None`.
pub fn build_controller(
    ctx: RunContext,
    prepared: PreparedRun,
    backend: Option<Arc<dyn OracleBackend>>,
) -> Result<LoopController, QalError> {
    let backend: Arc<dyn OracleBackend> = match (backend, ctx.config.oracle.kind) {
        (Some(backend), _) => backend,
        (None, OracleKind::Simulated) => Arc::new(simulated_backend(&ctx, prepared.truth)),
        (None, OracleKind::Handoff) => {
            return Err(crate::domain::ConfigError::Invalid(
                "handoff oracle requires a backend".to_string(),
            )
            .into())
        }
    };
    let gateway = OracleGateway::new(backend, ctx.config.oracle.settings.clone());
    let surrogate = GaussianProcess::new(ctx.config.surrogate, ctx.config.run.min_fit_examples);
    LoopController::new(ctx, prepared.pool, prepared.eval, Box::new(surrogate), gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QalConfig;

    fn dataset(n: usize) -> Dataset {
        Dataset::from_rows((0..n).map(|i| {
            let x = i as f64 / n as f64;
            (
                Candidate::new(format!("c{:04}", i), vec![x, x * x]),
                Some((x * 6.0).sin()),
            )
        }))
    }

    fn context(raw: &str) -> RunContext {
        RunContext::new(QalConfig::from_toml_str(raw).expect("config"), Some("t".to_string()))
    }

    #[test]
    fn test_prepare_run_seeds_pool() {
        let ctx = context("[loop]\nseed_size = 10\neval_size = 20\n");
        let prepared = prepare_run(&ctx, dataset(100)).expect("prepare");
        assert_eq!(prepared.eval.len(), 20);
        assert_eq!(prepared.pool.labeled_len(), 10);
        assert_eq!(prepared.pool.unlabeled_len(), 70);
        assert_eq!(prepared.truth.len(), 80);
    }

    fn mixed_dataset(labeled: usize, unlabeled: usize) -> Dataset {
        let rows = (0..labeled + unlabeled).map(|i| {
            let x = i as f64 / labeled as f64;
            let label = (i < labeled).then(|| (x * 6.0).sin());
            let far = if i < labeled { 0.0 } else { 50.0 };
            (Candidate::new(format!("c{:04}", i), vec![x + far, x * x]), label)
        });
        Dataset::from_rows(rows)
    }

    #[test]
    fn test_simulated_run_excludes_rows_without_labels() {
        let ctx = context("[loop]\nseed_size = 10\neval_size = 20\n");
        let prepared = prepare_run(&ctx, mixed_dataset(60, 5)).expect("prepare");
        assert_eq!(prepared.pool.unlabeled_len(), 30);
        let unlabelable: Vec<&str> = prepared
            .pool
            .excluded()
            .iter()
            .filter(|e| matches!(e.reason, ExclusionReason::Unlabelable { .. }))
            .map(|e| e.candidate_id.as_str())
            .collect();
        assert_eq!(unlabelable, vec!["c0060", "c0061", "c0062", "c0063", "c0064"]);
    }

    #[test]
    fn test_handoff_run_keeps_rows_without_labels() {
        let ctx = context(
            "[loop]\nseed_size = 10\neval_size = 20\n[oracle]\nkind = \"handoff\"\n",
        );
        let prepared = prepare_run(&ctx, mixed_dataset(60, 5)).expect("prepare");
        assert_eq!(prepared.pool.unlabeled_len(), 35);
        assert!(prepared.pool.excluded().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_run_never_fails_on_unlabeled_rows() {
        let ctx = context(
            "[loop]\nseed_size = 10\neval_size = 20\nbatch_size = 5\nmax_iterations = 6\n",
        );
        let prepared = prepare_run(&ctx, mixed_dataset(60, 5)).expect("prepare");
        let controller = build_controller(ctx, prepared, None).expect("controller");
        let outcome = controller.run().await.expect("run");
        assert_eq!(outcome.history.iter().map(|r| r.failed).sum::<usize>(), 0);
        assert_eq!(outcome.summary.cumulative_labels, 40);
    }

    #[test]
    fn test_prepare_run_fails_without_enough_labels() {
        let ctx = context("[loop]\nseed_size = 50\neval_size = 200\n");
        let err = prepare_run(&ctx, dataset(100)).expect_err("too small");
        assert!(matches!(err, QalError::Data(_)));
    }

    #[tokio::test]
    async fn test_build_and_run_simulated() {
        let ctx = context("[loop]\nseed_size = 10\neval_size = 20\nbatch_size = 5\nmax_iterations = 3\n");
        let prepared = prepare_run(&ctx, dataset(100)).expect("prepare");
        let controller = build_controller(ctx, prepared, None).expect("controller");
        let outcome = controller.run().await.expect("run");
        assert_eq!(outcome.summary.iterations_completed, 3);
        assert_eq!(outcome.summary.cumulative_labels, 25);
    }

    #[test]
    fn test_handoff_without_backend_is_config_error() {
        let ctx = context(
            "[loop]\nseed_size = 10\neval_size = 20\n[oracle]\nkind = \"handoff\"\n",
        );
        let prepared = prepare_run(&ctx, dataset(100)).expect("prepare");
        assert!(matches!(
            build_controller(ctx, prepared, None),
            Err(QalError::Config(_))
        ));
    }
}
