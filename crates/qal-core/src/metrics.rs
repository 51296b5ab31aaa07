//! Metrics recorder: an append-only log of iteration records and the
//! one-shot run summary derived from it.

use crate::acquisition::StrategyKind;
use crate::config::MetricsConfig;
use crate::domain::{IterationRecord, QalError, RunSummary, TerminationReason};
use chrono::{DateTime, Utc};

/// `(baseline - consumed) / baseline`.
pub fn label_efficiency_gain(baseline_label_budget: usize, labels_consumed: usize) -> f64 {
    if baseline_label_budget == 0 {
        return 0.0;
    }
    let baseline = baseline_label_budget as f64;
    (baseline - labels_consumed as f64) / baseline
}

/// Run facts the recorder cannot see itself.
#[derive(Debug, Clone)]
pub struct SummaryInputs {
    pub run_id: String,
    pub strategy: StrategyKind,
    pub termination: TerminationReason,
    pub seed_labels: usize,
    pub cumulative_labels: usize,
    pub started_at: DateTime<Utc>,
}

/// Accumulates per-round records in order.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    config: MetricsConfig,
    records: Vec<IterationRecord>,
    labels_to_target: Option<usize>,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            labels_to_target: None,
        }
    }

    /// Append a record. Iterations must run 0, 1, 2, ... without gaps.
    pub fn record(&mut self, record: IterationRecord) -> Result<(), QalError> {
        let expected = self.records.len() as u64;
        if record.iteration != expected {
            return Err(QalError::RecordOutOfOrder {
                expected,
                actual: record.iteration,
            });
        }
        if self.labels_to_target.is_none() {
            if let Some(target) = self.config.target_rmse {
                if record.rmse <= target {
                    self.labels_to_target = Some(record.labeled);
                }
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Index of the next round.
    pub fn next_iteration(&self) -> u64 {
        self.records.len() as u64
    }

    /// Give up the records without summarising, for aborted runs.
    pub fn into_history(self) -> Vec<IterationRecord> {
        self.records
    }

    /// Compute the summary. Consumes the recorder, so it happens once.
    pub fn finalize(self, inputs: SummaryInputs) -> (RunSummary, Vec<IterationRecord>) {
        let rmse_history: Vec<f64> = self.records.iter().map(|r| r.rmse).collect();
        let labels_consumed = self.labels_to_target.unwrap_or(inputs.cumulative_labels);
        let summary = RunSummary {
            run_id: inputs.run_id,
            strategy: inputs.strategy,
            iterations_completed: self.records.len() as u64,
            termination: inputs.termination,
            final_rmse: rmse_history.last().copied(),
            rmse_history,
            cumulative_labels: inputs.cumulative_labels,
            seed_labels: inputs.seed_labels,
            acquired_labels: inputs.cumulative_labels.saturating_sub(inputs.seed_labels),
            labels_to_target: self.labels_to_target,
            target_rmse: self.config.target_rmse,
            baseline_label_budget: self.config.baseline_label_budget,
            label_efficiency_gain: label_efficiency_gain(
                self.config.baseline_label_budget,
                labels_consumed,
            ),
            started_at: inputs.started_at,
            finished_at: Utc::now(),
        };
        (summary, self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u64, labeled: usize, rmse: f64) -> IterationRecord {
        IterationRecord {
            iteration,
            labeled,
            unlabeled: 1000 - labeled,
            rmse,
            mean_std: 0.5,
            selected_mean_std: 0.8,
            dispatched: 25,
            completed: 25,
            queued: 0,
            failed: 0,
            integrity_failures: 0,
            recorded_at: Utc::now(),
        }
    }

    fn inputs(cumulative_labels: usize) -> SummaryInputs {
        SummaryInputs {
            run_id: "run-1".to_string(),
            strategy: StrategyKind::Uncertainty,
            termination: TerminationReason::MaxIterations,
            seed_labels: 50,
            cumulative_labels,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_gain_formula() {
        assert!((label_efficiency_gain(1000, 300) - 0.7).abs() < 1e-12);
        assert!((label_efficiency_gain(100, 150) + 0.5).abs() < 1e-12);
        assert_eq!(label_efficiency_gain(0, 10), 0.0);
    }

    #[test]
    fn test_records_must_be_consecutive() {
        let mut recorder = MetricsRecorder::new(MetricsConfig::default());
        recorder.record(record(0, 75, 0.3)).expect("first");
        let err = recorder.record(record(2, 100, 0.2)).expect_err("gap");
        assert!(matches!(
            err,
            QalError::RecordOutOfOrder {
                expected: 1,
                actual: 2
            }
        ));
        recorder.record(record(1, 100, 0.2)).expect("second");
        assert_eq!(recorder.next_iteration(), 2);
    }

    #[test]
    fn test_summary_uses_cumulative_labels_without_target() {
        let mut recorder = MetricsRecorder::new(MetricsConfig::default());
        recorder.record(record(0, 75, 0.3)).expect("r0");
        recorder.record(record(1, 100, 0.2)).expect("r1");
        let (summary, history) = recorder.finalize(inputs(100));
        assert_eq!(history.len(), 2);
        assert_eq!(summary.iterations_completed, 2);
        assert_eq!(summary.rmse_history, vec![0.3, 0.2]);
        assert_eq!(summary.final_rmse, Some(0.2));
        assert_eq!(summary.acquired_labels, 50);
        assert!((summary.label_efficiency_gain - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_summary_uses_labels_to_target_when_reached() {
        let config = MetricsConfig {
            baseline_label_budget: 1000,
            target_rmse: Some(0.25),
        };
        let mut recorder = MetricsRecorder::new(config);
        recorder.record(record(0, 75, 0.3)).expect("r0");
        recorder.record(record(1, 100, 0.2)).expect("r1");
        recorder.record(record(2, 125, 0.1)).expect("r2");
        let (summary, _) = recorder.finalize(inputs(125));
        assert_eq!(summary.labels_to_target, Some(100));
        assert!((summary.label_efficiency_gain - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_empty_history() {
        let recorder = MetricsRecorder::new(MetricsConfig::default());
        let (summary, _) = recorder.finalize(inputs(50));
        assert_eq!(summary.final_rmse, None);
        assert_eq!(summary.iterations_completed, 0);
    }
}
