//! Loop controller: drives one round at a time through
//! `Idle → Fitting → Scoring → Dispatching → Reconciling → Recording → (Idle | Terminated)`.
//!
//! A single task owns every collaborator, so no two rounds overlap and the
//! surrogate is never queried while it is being refit. Cancellation is
//! honoured only between rounds; in-flight oracle requests are left queued
//! and reported so a later process can adopt them.

use crate::acquisition::{select_batch, strategy_for, AcquisitionStrategy, Objective, ScoringContext};
use crate::config::RunContext;
use crate::domain::{
    AcquisitionError, Candidate, CandidateId, ConfigError, IterationRecord, LabeledExample,
    OracleRequest, Origin, PoolError, QalError, RequestId, RunSummary, TerminationReason,
};
use crate::gateway::OracleGateway;
use crate::metrics::{MetricsRecorder, SummaryInputs};
use crate::obs::{self, RunSpan};
use crate::pool::{Exclusion, PoolStore};
use crate::surrogate::{rmse, Prediction, SurrogateModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Fitting,
    Scoring,
    Dispatching,
    Reconciling,
    Recording,
    Terminated,
}

impl LoopState {
    /// Legal transitions. Any live phase may terminate (fatal error); the
    /// rest follow the round order.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Fitting)
            | (Fitting, Scoring)
            | (Scoring, Dispatching)
            | (Dispatching, Reconciling)
            | (Reconciling, Recording)
            | (Recording, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Fitting => "fitting",
            LoopState::Scoring => "scoring",
            LoopState::Dispatching => "dispatching",
            LoopState::Reconciling => "reconciling",
            LoopState::Recording => "recording",
            LoopState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// A fatal abort: the phase, the cause, and every round completed before it.
#[derive(Debug, thiserror::Error)]
#[error("run aborted during {phase}: {cause}")]
pub struct RunAborted {
    pub phase: LoopState,
    #[source]
    pub cause: QalError,
    pub history: Vec<IterationRecord>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub history: Vec<IterationRecord>,
    /// Requests left queued at termination, safe to adopt on restart.
    pub outstanding: Vec<OracleRequest>,
    pub excluded: Vec<Exclusion>,
}

pub struct LoopController {
    ctx: RunContext,
    state: LoopState,
    pool: PoolStore,
    eval: Vec<(Candidate, f64)>,
    surrogate: Box<dyn SurrogateModel>,
    strategy: Box<dyn AcquisitionStrategy>,
    gateway: OracleGateway,
    metrics: MetricsRecorder,
    carried: Vec<RequestId>,
    /// Candidate -> first iteration at which it may be selected again.
    cooldown: HashMap<CandidateId, u64>,
    stop: Arc<AtomicBool>,
    termination: Option<TerminationReason>,
    started_at: DateTime<Utc>,
}

impl LoopController {
    /// Assemble a controller around a seeded pool.
    ///
    /// `eval` must be non-empty and disjoint from the pool.
    pub fn new(
        ctx: RunContext,
        pool: PoolStore,
        eval: Vec<(Candidate, f64)>,
        surrogate: Box<dyn SurrogateModel>,
        gateway: OracleGateway,
    ) -> Result<Self, QalError> {
        if eval.is_empty() {
            return Err(ConfigError::Invalid(
                "evaluation slice is empty; RMSE would be meaningless".to_string(),
            )
            .into());
        }
        if let Some((overlap, _)) = eval
            .iter()
            .find(|(c, _)| pool.is_labeled(c.id()) || pool.is_unlabeled(c.id()))
        {
            return Err(ConfigError::Invalid(format!(
                "evaluation candidate {} is also in the pool",
                overlap.id()
            ))
            .into());
        }
        let strategy = strategy_for(ctx.config.run.strategy);
        let metrics = MetricsRecorder::new(ctx.config.metrics);
        Ok(Self {
            ctx,
            state: LoopState::Idle,
            pool,
            eval,
            surrogate,
            strategy,
            gateway,
            metrics,
            carried: Vec::new(),
            cooldown: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
            termination: None,
            started_at: Utc::now(),
        })
    }

    /// Flag checked between rounds; set it to stop the run after the current round.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn pool(&self) -> &PoolStore {
        &self.pool
    }

    pub fn gateway(&self) -> &OracleGateway {
        &self.gateway
    }

    pub fn history(&self) -> &[IterationRecord] {
        self.metrics.history()
    }

    /// Requests carried into the next round.
    pub fn carried(&self) -> &[RequestId] {
        &self.carried
    }

    fn transition(&mut self, next: LoopState) -> Result<(), QalError> {
        if !self.state.can_transition_to(next) {
            return Err(QalError::InvalidPhaseTransition {
                current: self.state.to_string(),
                requested: next.to_string(),
            });
        }
        obs::emit_phase(self.metrics.next_iteration(), &next.to_string());
        self.state = next;
        Ok(())
    }

    fn is_cooling(&self, id: &CandidateId, iteration: u64) -> bool {
        self.cooldown.get(id).is_some_and(|&from| iteration < from)
    }

    fn incumbent(&self) -> Option<f64> {
        let labels = self.pool.labeled().iter().map(|ex: &LabeledExample| ex.label);
        match self.ctx.config.acquisition.objective {
            Objective::Maximize => labels.max_by(f64::total_cmp),
            Objective::Minimize => labels.min_by(f64::total_cmp),
        }
    }

    /// Run one round.
    ///
    /// Returns `Ok(None)` when the pool is exhausted and the controller has
    /// terminated instead of running a round.
    pub async fn step(&mut self) -> Result<Option<IterationRecord>, QalError> {
        let iteration = self.metrics.next_iteration();
        let run = self.ctx.config.run.clone();

        if self.pool.unlabeled_len() == 0 {
            self.transition(LoopState::Terminated)?;
            self.termination = Some(TerminationReason::PoolExhausted);
            return Ok(None);
        }

        self.transition(LoopState::Fitting)?;
        self.surrogate.fit(self.pool.labeled())?;

        self.transition(LoopState::Scoring)?;
        let in_flight: HashSet<CandidateId> = self
            .gateway
            .outstanding()
            .into_iter()
            .map(|r| r.candidate_id().clone())
            .collect();
        let eligible: Vec<&Candidate> = self
            .pool
            .unlabeled()
            .filter(|c| !in_flight.contains(c.id()) && !self.is_cooling(c.id(), iteration))
            .collect();
        let predictions = if eligible.is_empty() {
            Vec::new()
        } else {
            self.surrogate.predict(&eligible)?
        };
        let mean_std = mean(predictions.iter().map(|p| p.std));
        let context = ScoringContext {
            iteration,
            seed: self.ctx.seed,
            incumbent: self.incumbent(),
            objective: self.ctx.config.acquisition.objective,
            xi: self.ctx.config.acquisition.xi,
        };
        let scores = self.strategy.score(&eligible, &predictions, &context);

        self.transition(LoopState::Dispatching)?;
        let batch = match select_batch(&scores, run.batch_size) {
            Ok(batch) => batch,
            Err(AcquisitionError::InsufficientPool { available, .. }) if run.shrink_final_batch => {
                info!(iteration, requested = run.batch_size, available, "shrinking batch to eligible pool");
                select_batch(&scores, available)?
            }
            Err(err) => return Err(err.into()),
        };
        let selected_mean_std = mean(batch.iter().filter_map(|id| scores.get(id)).map(|s| s.std));

        let mut dispatched = Vec::with_capacity(batch.len());
        for id in &batch {
            let candidate = self
                .pool
                .get_unlabeled(id)
                .ok_or_else(|| PoolError::NotFound(id.clone()))?;
            let request = self.gateway.submit(candidate).await?;
            dispatched.push(request.request_id().clone());
        }

        self.transition(LoopState::Reconciling)?;
        let mut awaited = std::mem::take(&mut self.carried);
        awaited.extend(dispatched.iter().cloned());
        let outcome = self
            .gateway
            .await_batch(&awaited, run.oracle_timeout(), run.poll_interval())
            .await?;

        for request in &outcome.completed {
            let Some(label) = request.result() else {
                continue;
            };
            self.pool
                .promote(request.candidate_id(), label, Origin::Acquired { iteration })?;
        }
        for request in &outcome.failed {
            warn!(
                request_id = %request.request_id(),
                candidate_id = %request.candidate_id(),
                failure = ?request.failure(),
                "oracle request failed; cooling down candidate"
            );
            self.cooldown.insert(
                request.candidate_id().clone(),
                iteration + run.cooldown_rounds + 1,
            );
        }
        self.carried = outcome
            .still_pending
            .iter()
            .map(|r| r.request_id().clone())
            .collect();

        self.transition(LoopState::Recording)?;
        let eval_candidates: Vec<&Candidate> = self.eval.iter().map(|(c, _)| c).collect();
        let eval_labels: Vec<f64> = self.eval.iter().map(|(_, y)| *y).collect();
        let eval_predictions: Vec<Prediction> = if eval_candidates.is_empty() {
            Vec::new()
        } else {
            self.surrogate.predict(&eval_candidates)?
        };

        let record = IterationRecord {
            iteration,
            labeled: self.pool.labeled_len(),
            unlabeled: self.pool.unlabeled_len(),
            rmse: rmse(&eval_predictions, &eval_labels),
            mean_std,
            selected_mean_std,
            dispatched: dispatched.len(),
            completed: outcome.completed.len(),
            queued: outcome.still_pending.len(),
            failed: outcome.failed.len(),
            integrity_failures: outcome.integrity_failures(),
            recorded_at: Utc::now(),
        };
        self.metrics.record(record.clone())?;
        obs::emit_round_recorded(
            iteration,
            record.labeled,
            record.unlabeled,
            record.rmse,
            record.completed,
            record.queued,
        );
        self.transition(LoopState::Idle)?;
        Ok(Some(record))
    }

    /// Drive rounds until a stopping condition, then compute the summary.
    pub async fn run(mut self) -> Result<RunOutcome, RunAborted> {
        let run_id = self.ctx.run_id.clone();
        let _span = RunSpan::enter(&run_id);
        obs::emit_run_started(
            &run_id,
            &self.strategy.kind().to_string(),
            self.pool.labeled_len(),
            self.pool.unlabeled_len(),
        );

        while self.termination.is_none() {
            if self.stop.load(Ordering::SeqCst) {
                self.termination = Some(TerminationReason::Cancelled);
                break;
            }
            if self.metrics.next_iteration() >= self.ctx.config.run.max_iterations {
                self.termination = Some(TerminationReason::MaxIterations);
                break;
            }
            if let Err(cause) = self.step().await {
                let phase = self.state;
                obs::emit_run_aborted(&run_id, &phase.to_string(), &cause);
                self.state = LoopState::Terminated;
                return Err(RunAborted {
                    phase,
                    cause,
                    history: self.metrics.into_history(),
                });
            }
        }

        if self.state != LoopState::Terminated {
            self.state = LoopState::Terminated;
        }
        let termination = self.termination.unwrap_or(TerminationReason::MaxIterations);
        let (summary, history) = self.metrics.finalize(SummaryInputs {
            run_id: run_id.clone(),
            strategy: self.strategy.kind(),
            termination,
            seed_labels: self.pool.seed_len(),
            cumulative_labels: self.pool.labeled_len(),
            started_at: self.started_at,
        });
        obs::emit_run_finished(
            &run_id,
            &termination.to_string(),
            summary.iterations_completed,
            summary.cumulative_labels,
            summary.final_rmse,
        );
        Ok(RunOutcome {
            summary,
            history,
            outstanding: self.gateway.outstanding(),
            excluded: self.pool.excluded().to_vec(),
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_order_transitions() {
        use LoopState::*;
        let order = [Idle, Fitting, Scoring, Dispatching, Reconciling, Recording, Idle];
        for pair in order.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Idle.can_transition_to(Scoring));
        assert!(!Recording.can_transition_to(Fitting));
        assert!(Scoring.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Idle));
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(std::iter::empty()), 0.0);
        assert_eq!(mean([1.0, 3.0].into_iter()), 2.0);
    }

    #[test]
    fn test_run_aborted_message_names_phase() {
        let aborted = RunAborted {
            phase: LoopState::Fitting,
            cause: crate::domain::SurrogateError::InsufficientData { got: 2, min: 5 }.into(),
            history: Vec::new(),
        };
        let msg = aborted.to_string();
        assert!(msg.contains("fitting"));
        assert!(msg.contains("insufficient training data"));
    }
}
