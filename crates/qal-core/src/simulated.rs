//! In-memory oracle backend answering from a ground-truth table.
//!
//! Used by `qal run` with `oracle.kind = "simulated"` and by the test suite.
//! Latency, failures and tampered hashes are all configurable.

use crate::domain::{CandidateId, OracleError, RequestId};
use crate::domain::fingerprint::fingerprint_value;
use crate::gateway::{BackendReport, OracleBackend, Submission};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug)]
struct Job {
    candidate_id: CandidateId,
    settings_fingerprint: String,
    polls: u32,
    outcome: Option<BackendReport>,
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    jobs: HashMap<RequestId, Job>,
    submissions: usize,
}

/// Simulated evaluation backend.
#[derive(Debug)]
pub struct SimulatedOracle {
    truth: HashMap<CandidateId, f64>,
    completion_polls: u32,
    failure_rate: f64,
    never_complete: bool,
    tampered: HashSet<CandidateId>,
    state: Mutex<SimState>,
}

impl SimulatedOracle {
    /// Answer each candidate with its ground-truth label on the first poll.
    pub fn new<K: Into<CandidateId>>(truth: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self {
            truth: truth.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            completion_polls: 1,
            failure_rate: 0.0,
            never_complete: false,
            tampered: HashSet::new(),
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(0),
                jobs: HashMap::new(),
                submissions: 0,
            }),
        }
    }

    /// Complete on the `polls`-th poll of a request (minimum 1).
    pub fn with_completion_polls(mut self, polls: u32) -> Self {
        self.completion_polls = polls.max(1);
        self
    }

    /// Fail evaluations with probability `rate`, drawn from a seeded generator.
    pub fn with_failure_rate(mut self, rate: f64, seed: u64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Never finish any request.
    pub fn never_completing(mut self) -> Self {
        self.never_complete = true;
        self
    }

    /// Report a wrong settings hash for these candidates.
    pub fn with_tampered<K: Into<CandidateId>>(mut self, ids: impl IntoIterator<Item = K>) -> Self {
        self.tampered = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Distinct submissions accepted so far.
    pub async fn submissions(&self) -> usize {
        self.state.lock().await.submissions
    }

    fn tampered_hash(fingerprint: &str) -> String {
        fingerprint_value(&serde_json::json!({ "tampered": fingerprint }))
            .unwrap_or_else(|_| "0".repeat(64))
    }
}

#[async_trait]
impl OracleBackend for SimulatedOracle {
    async fn submit(&self, submission: &Submission) -> Result<(), OracleError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&submission.request_id) {
            return Ok(());
        }
        state.jobs.insert(
            submission.request_id.clone(),
            Job {
                candidate_id: submission.payload.candidate_id.clone(),
                settings_fingerprint: submission.settings_fingerprint.clone(),
                polls: 0,
                outcome: None,
            },
        );
        state.submissions += 1;
        Ok(())
    }

    async fn poll(&self, request_id: &RequestId) -> Result<BackendReport, OracleError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(request_id)
            .ok_or_else(|| OracleError::UnknownRequest(request_id.clone()))?;

        if let Some(outcome) = &job.outcome {
            return Ok(outcome.clone());
        }
        job.polls += 1;
        if self.never_complete || job.polls < self.completion_polls {
            return Ok(BackendReport::Queued);
        }

        let outcome = if self.failure_rate > 0.0 && state.rng.gen::<f64>() < self.failure_rate {
            BackendReport::Failed {
                message: "simulated evaluation failure".to_string(),
            }
        } else {
            match self.truth.get(&job.candidate_id) {
                Some(&result) => {
                    let settings_hash = if self.tampered.contains(&job.candidate_id) {
                        Self::tampered_hash(&job.settings_fingerprint)
                    } else {
                        job.settings_fingerprint.clone()
                    };
                    BackendReport::Completed {
                        result,
                        settings_hash,
                    }
                }
                None => BackendReport::Failed {
                    message: format!("no ground truth for {}", job.candidate_id),
                },
            }
        };
        job.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Candidate, OraclePayload};

    fn submission(id: &str) -> Submission {
        let payload =
            OraclePayload::for_candidate(&Candidate::new(id, vec![1.0]), serde_json::json!({}));
        let fp = payload.fingerprint().expect("fp");
        Submission {
            request_id: RequestId::derive(&CandidateId::new(id), &fp, 0),
            settings_fingerprint: fp,
            payload,
        }
    }

    #[tokio::test]
    async fn test_completes_after_configured_polls() {
        let oracle = SimulatedOracle::new([("a", 3.5)]).with_completion_polls(2);
        let sub = submission("a");
        oracle.submit(&sub).await.expect("submit");
        assert_eq!(oracle.poll(&sub.request_id).await.expect("p1"), BackendReport::Queued);
        assert_eq!(
            oracle.poll(&sub.request_id).await.expect("p2"),
            BackendReport::Completed {
                result: 3.5,
                settings_hash: sub.settings_fingerprint.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_submit_counted_once() {
        let oracle = SimulatedOracle::new([("a", 1.0)]);
        let sub = submission("a");
        oracle.submit(&sub).await.expect("first");
        oracle.submit(&sub).await.expect("second");
        assert_eq!(oracle.submissions().await, 1);
    }

    #[tokio::test]
    async fn test_tampered_hash_differs() {
        let oracle = SimulatedOracle::new([("a", 1.0)]).with_tampered(["a"]);
        let sub = submission("a");
        oracle.submit(&sub).await.expect("submit");
        match oracle.poll(&sub.request_id).await.expect("poll") {
            BackendReport::Completed { settings_hash, .. } => {
                assert_ne!(settings_hash, sub.settings_fingerprint)
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_truth_fails() {
        let oracle = SimulatedOracle::new(Vec::<(&str, f64)>::new());
        let sub = submission("ghost");
        oracle.submit(&sub).await.expect("submit");
        assert!(matches!(
            oracle.poll(&sub.request_id).await.expect("poll"),
            BackendReport::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let oracle = SimulatedOracle::new([("a", 1.0)]);
        let err = oracle
            .poll(&submission("a").request_id)
            .await
            .expect_err("never submitted");
        assert!(matches!(err, OracleError::UnknownRequest(_)));
    }
}
