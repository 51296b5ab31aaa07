//! Oracle gateway: the only component that crosses the latency boundary.
//!
//! Guarantees:
//! - At most one in-flight request per candidate; resubmitting returns the
//!   existing request.
//! - `poll` never blocks on the backend beyond a single call, and transient
//!   backend errors leave the request status unchanged.
//! - Completed results are accepted only when the oracle's settings hash
//!   matches the fingerprint recomputed from the submitted payload.
//! - Requests still pending at the deadline are reported, never dropped.

use crate::domain::{
    Candidate, CandidateId, FailureReason, OracleError, OraclePayload, OracleRequest, RequestId,
    RequestStatus,
};
use crate::obs;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What the gateway hands to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub request_id: RequestId,
    pub settings_fingerprint: String,
    pub payload: OraclePayload,
}

/// Backend view of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackendReport {
    Queued,
    Completed { result: f64, settings_hash: String },
    Failed { message: String },
}

/// An external evaluation process.
///
/// `submit` must be idempotent per request id: a backend that already knows
/// the id accepts it again without starting a second evaluation.
#[async_trait]
pub trait OracleBackend: Send + Sync {
    /// Accept a submission. `OracleError::Backend` means "try again later".
    async fn submit(&self, submission: &Submission) -> Result<(), OracleError>;

    /// Report current status without waiting for completion.
    async fn poll(&self, request_id: &RequestId) -> Result<BackendReport, OracleError>;

    fn name(&self) -> &'static str;
}

/// Requests partitioned by outcome after `await_batch`.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub completed: Vec<OracleRequest>,
    pub still_pending: Vec<OracleRequest>,
    pub failed: Vec<OracleRequest>,
}

impl BatchOutcome {
    pub fn integrity_failures(&self) -> usize {
        self.failed
            .iter()
            .filter(|r| matches!(r.failure(), Some(FailureReason::IntegrityMismatch { .. })))
            .count()
    }
}

/// Tracks every request of a run and talks to the backend.
pub struct OracleGateway {
    backend: Arc<dyn OracleBackend>,
    settings: serde_json::Value,
    requests: BTreeMap<RequestId, OracleRequest>,
    payloads: HashMap<RequestId, OraclePayload>,
    latest: HashMap<CandidateId, RequestId>,
}

impl OracleGateway {
    /// `settings` is folded into every payload and therefore every fingerprint.
    pub fn new(backend: Arc<dyn OracleBackend>, settings: serde_json::Value) -> Self {
        Self {
            backend,
            settings,
            requests: BTreeMap::new(),
            payloads: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Submit a candidate for evaluation.
    ///
    /// Returns the existing request when the candidate already has one in
    /// flight, or a completed one for the same fingerprint. A failed request
    /// is followed by a fresh attempt with a new request id.
    pub async fn submit(&mut self, candidate: &Candidate) -> Result<OracleRequest, OracleError> {
        let payload = OraclePayload::for_candidate(candidate, self.settings.clone());
        let fingerprint = payload.fingerprint()?;

        let previous = self
            .latest
            .get(candidate.id())
            .and_then(|rid| self.requests.get(rid));
        if let Some(existing) = previous {
            let same_inputs = existing.settings_fingerprint() == fingerprint;
            if existing.is_in_flight()
                || (same_inputs && existing.status() == RequestStatus::Completed)
            {
                return Ok(existing.clone());
            }
        }
        let attempt = previous.map(|r| r.attempt() + 1).unwrap_or(0);

        let mut request = OracleRequest::new(candidate.id().clone(), fingerprint.clone(), attempt);
        let submission = Submission {
            request_id: request.request_id().clone(),
            settings_fingerprint: fingerprint,
            payload: payload.clone(),
        };
        Self::dispatch(self.backend.as_ref(), &mut request, &submission).await?;
        obs::emit_oracle_submitted(
            request.request_id().as_str(),
            candidate.id().as_str(),
            attempt,
        );

        let rid = request.request_id().clone();
        self.payloads.insert(rid.clone(), payload);
        self.latest.insert(candidate.id().clone(), rid.clone());
        self.requests.insert(rid, request.clone());
        Ok(request)
    }

    async fn dispatch(
        backend: &dyn OracleBackend,
        request: &mut OracleRequest,
        submission: &Submission,
    ) -> Result<(), OracleError> {
        match backend.submit(submission).await {
            Ok(()) => request.mark_queued(),
            Err(OracleError::Backend(message)) => {
                warn!(request_id = %request.request_id(), error = %message, "oracle submit deferred");
                Ok(())
            }
            Err(other) => request.fail(FailureReason::Rejected {
                message: other.to_string(),
            }),
        }
    }

    /// Refresh one request's status.
    pub async fn poll(&mut self, request_id: &RequestId) -> Result<OracleRequest, OracleError> {
        self.refresh(std::slice::from_ref(request_id)).await?;
        self.requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| OracleError::UnknownRequest(request_id.clone()))
    }

    /// Poll `ids` until all are terminal or `timeout` elapses.
    ///
    /// The backend is always polled at least once, even with a zero timeout.
    pub async fn await_batch(
        &mut self,
        ids: &[RequestId],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<BatchOutcome, OracleError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.refresh(ids).await?;
            let done = ids
                .iter()
                .filter_map(|id| self.requests.get(id))
                .all(|r| !r.is_in_flight());
            let now = tokio::time::Instant::now();
            if done || now >= deadline {
                break;
            }
            let remaining = deadline - now;
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }

        let mut outcome = BatchOutcome::default();
        for id in ids {
            let Some(request) = self.requests.get(id) else {
                continue;
            };
            match request.status() {
                RequestStatus::Completed => outcome.completed.push(request.clone()),
                RequestStatus::Failed => outcome.failed.push(request.clone()),
                RequestStatus::Pending | RequestStatus::Queued => {
                    outcome.still_pending.push(request.clone())
                }
            }
        }
        Ok(outcome)
    }

    async fn refresh(&mut self, ids: &[RequestId]) -> Result<(), OracleError> {
        if let Some(unknown) = ids.iter().find(|id| !self.requests.contains_key(*id)) {
            return Err(OracleError::UnknownRequest(unknown.clone()));
        }

        // Requests the backend never accepted are offered again before polling.
        for id in ids {
            let (Some(request), Some(payload)) = (self.requests.get_mut(id), self.payloads.get(id))
            else {
                continue;
            };
            if request.status() == RequestStatus::Pending {
                let submission = Submission {
                    request_id: id.clone(),
                    settings_fingerprint: request.settings_fingerprint().to_string(),
                    payload: payload.clone(),
                };
                Self::dispatch(self.backend.as_ref(), request, &submission).await?;
            }
        }

        let in_flight: Vec<RequestId> = ids
            .iter()
            .filter(|id| self.requests.get(*id).is_some_and(|r| r.is_in_flight()))
            .cloned()
            .collect();
        let backend = Arc::clone(&self.backend);
        let reports = join_all(in_flight.into_iter().map(|id| {
            let backend = Arc::clone(&backend);
            async move {
                let report = backend.poll(&id).await;
                (id, report)
            }
        }))
        .await;

        for (id, report) in reports {
            match report {
                Ok(report) => self.apply(&id, report)?,
                Err(err) => debug!(request_id = %id, error = %err, "oracle poll failed; status unchanged"),
            }
        }
        Ok(())
    }

    fn apply(&mut self, id: &RequestId, report: BackendReport) -> Result<(), OracleError> {
        let expected = match self.payloads.get(id) {
            Some(payload) => Some(payload.fingerprint()?),
            None => None,
        };
        let request = self
            .requests
            .get_mut(id)
            .ok_or_else(|| OracleError::UnknownRequest(id.clone()))?;

        match report {
            BackendReport::Queued => {
                if request.status() == RequestStatus::Pending {
                    request.mark_queued()?;
                }
            }
            BackendReport::Completed {
                result,
                settings_hash,
            } => {
                let recomputed = expected.unwrap_or_else(|| request.settings_fingerprint().to_string());
                if recomputed != request.settings_fingerprint() {
                    request.fail(FailureReason::IntegrityMismatch {
                        expected: recomputed,
                        actual: request.settings_fingerprint().to_string(),
                    })?;
                } else if !result.is_finite() {
                    request.fail(FailureReason::Evaluation {
                        message: format!("non-finite result {}", result),
                    })?;
                } else {
                    request.complete(result, settings_hash)?;
                }
                if let Some(FailureReason::IntegrityMismatch { expected, actual }) =
                    request.failure()
                {
                    obs::emit_integrity_mismatch(id.as_str(), expected, actual);
                }
            }
            BackendReport::Failed { message } => {
                request.fail(FailureReason::Evaluation { message })?;
            }
        }
        Ok(())
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&OracleRequest> {
        self.requests.get(request_id)
    }

    /// Latest request for a candidate.
    pub fn latest_for(&self, candidate_id: &CandidateId) -> Option<&OracleRequest> {
        self.latest
            .get(candidate_id)
            .and_then(|rid| self.requests.get(rid))
    }

    /// Every request ever tracked, in request-id order.
    pub fn requests(&self) -> impl Iterator<Item = &OracleRequest> {
        self.requests.values()
    }

    /// Requests still pending or queued.
    pub fn outstanding(&self) -> Vec<OracleRequest> {
        self.requests
            .values()
            .filter(|r| r.is_in_flight())
            .cloned()
            .collect()
    }

    /// Re-register requests from a previous process so they are re-polled
    /// rather than resubmitted. Already-known ids are left untouched.
    pub fn adopt(&mut self, requests: impl IntoIterator<Item = OracleRequest>) -> usize {
        let mut adopted = 0;
        for request in requests {
            let rid = request.request_id().clone();
            if self.requests.contains_key(&rid) {
                continue;
            }
            let newer_known = self
                .latest
                .get(request.candidate_id())
                .and_then(|known| self.requests.get(known))
                .is_some_and(|known| known.attempt() >= request.attempt());
            if !newer_known {
                self.latest.insert(request.candidate_id().clone(), rid.clone());
            }
            self.requests.insert(rid, request);
            adopted += 1;
        }
        adopted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedOracle;

    fn candidate(id: &str) -> Candidate {
        Candidate::new(id, vec![1.0, 2.0])
    }

    fn gateway(oracle: SimulatedOracle) -> (OracleGateway, Arc<SimulatedOracle>) {
        let oracle = Arc::new(oracle);
        let gw = OracleGateway::new(oracle.clone(), serde_json::json!({ "functional": "PBE" }));
        (gw, oracle)
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_while_in_flight() {
        let (mut gw, oracle) = gateway(SimulatedOracle::new([("a", 1.0)]).with_completion_polls(3));
        let first = gw.submit(&candidate("a")).await.expect("first");
        let second = gw.submit(&candidate("a")).await.expect("second");
        assert_eq!(first.request_id(), second.request_id());
        assert_eq!(first.status(), RequestStatus::Queued);
        assert_eq!(oracle.submissions().await, 1);
        assert_eq!(gw.outstanding().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_request_is_reused() {
        let (mut gw, oracle) = gateway(SimulatedOracle::new([("a", 1.0)]));
        let req = gw.submit(&candidate("a")).await.expect("submit");
        let polled = gw.poll(req.request_id()).await.expect("poll");
        assert_eq!(polled.status(), RequestStatus::Completed);
        assert_eq!(polled.result(), Some(1.0));

        let again = gw.submit(&candidate("a")).await.expect("again");
        assert_eq!(again.request_id(), req.request_id());
        assert_eq!(oracle.submissions().await, 1);
    }

    #[tokio::test]
    async fn test_failed_request_gets_new_attempt() {
        let (mut gw, _) = gateway(SimulatedOracle::new([("a", 1.0)]).with_failure_rate(1.0, 7));
        let req = gw.submit(&candidate("a")).await.expect("submit");
        let polled = gw.poll(req.request_id()).await.expect("poll");
        assert_eq!(polled.status(), RequestStatus::Failed);

        let retry = gw.submit(&candidate("a")).await.expect("retry");
        assert_ne!(retry.request_id(), req.request_id());
        assert_eq!(retry.attempt(), 1);
    }

    #[tokio::test]
    async fn test_tampered_hash_is_integrity_failure() {
        let oracle = SimulatedOracle::new([("a", 1.0), ("b", 2.0)]).with_tampered(["b"]);
        let (mut gw, _) = gateway(oracle);
        let a = gw.submit(&candidate("a")).await.expect("a");
        let b = gw.submit(&candidate("b")).await.expect("b");
        let outcome = gw
            .await_batch(
                &[a.request_id().clone(), b.request_id().clone()],
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .await
            .expect("await");
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.integrity_failures(), 1);
        assert_eq!(outcome.failed[0].result(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_batch_times_out_with_pending() {
        let (mut gw, _) = gateway(SimulatedOracle::new([("a", 1.0)]).never_completing());
        let req = gw.submit(&candidate("a")).await.expect("submit");
        let outcome = gw
            .await_batch(
                &[req.request_id().clone()],
                Duration::from_secs(5),
                Duration::from_millis(500),
            )
            .await
            .expect("await");
        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.still_pending.len(), 1);
        assert_eq!(outcome.still_pending[0].status(), RequestStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_batch_waits_for_slow_completion() {
        let (mut gw, _) = gateway(SimulatedOracle::new([("a", 1.0)]).with_completion_polls(4));
        let req = gw.submit(&candidate("a")).await.expect("submit");
        let outcome = gw
            .await_batch(
                &[req.request_id().clone()],
                Duration::from_secs(10),
                Duration::from_millis(100),
            )
            .await
            .expect("await");
        assert_eq!(outcome.completed.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_unknown_request() {
        let (mut gw, _) = gateway(SimulatedOracle::new([("a", 1.0)]));
        let err = gw
            .poll(&RequestId::derive(&CandidateId::new("zz"), "00", 0))
            .await
            .expect_err("unknown");
        assert!(matches!(err, OracleError::UnknownRequest(_)));
    }

    #[tokio::test]
    async fn test_adopt_repolls_without_resubmitting() {
        let (mut first, oracle) =
            gateway(SimulatedOracle::new([("a", 1.0)]).with_completion_polls(2));
        let req = first.submit(&candidate("a")).await.expect("submit");
        let outstanding = first.outstanding();
        drop(first);

        let mut second = OracleGateway::new(oracle.clone(), serde_json::json!({ "functional": "PBE" }));
        assert_eq!(second.adopt(outstanding), 1);
        let again = second.submit(&candidate("a")).await.expect("resubmit");
        assert_eq!(again.request_id(), req.request_id());
        assert_eq!(oracle.submissions().await, 1);

        let polled = second.poll(req.request_id()).await.expect("poll");
        let polled = if polled.is_in_flight() {
            second.poll(req.request_id()).await.expect("poll again")
        } else {
            polled
        };
        assert_eq!(polled.status(), RequestStatus::Completed);
    }
}
