//! Oracle requests and their lifecycle.

use crate::domain::candidate::{is_path_component, Candidate, CandidateId};
use crate::domain::error::{ErrorClass, OracleError};
use crate::domain::fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a single oracle request.
///
/// Derived from the candidate id, the settings fingerprint and the attempt
/// number, so resubmitting identical inputs after a restart maps onto the
/// same request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn derive(candidate_id: &CandidateId, settings_fingerprint: &str, attempt: u32) -> Self {
        let short = &settings_fingerprint[..12.min(settings_fingerprint.len())];
        RequestId(format!("{}-{}-a{}", candidate_id, short, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a single directory entry.
    pub fn is_path_safe(&self) -> bool {
        is_path_component(&self.0)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an oracle request.
///
/// Transitions only move forward: `pending → queued → {completed, failed}`.
/// A pending request may also fail directly when the backend rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Queued,
    Completed,
    Failed,
}

impl RequestStatus {
    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Queued => 1,
            RequestStatus::Completed | RequestStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Queued => write!(f, "queued"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a request ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The oracle's result fingerprint did not match the submitted inputs.
    IntegrityMismatch { expected: String, actual: String },
    /// The backend reported a failed evaluation.
    Evaluation { message: String },
    /// The backend refused the submission.
    Rejected { message: String },
}

impl FailureReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureReason::IntegrityMismatch { .. } => ErrorClass::IntegrityMismatch,
            FailureReason::Evaluation { .. } | FailureReason::Rejected { .. } => {
                ErrorClass::TransientOracle
            }
        }
    }
}

/// Evaluation inputs sent to the oracle backend.
///
/// The settings fingerprint is computed over exactly this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OraclePayload {
    pub candidate_id: CandidateId,
    pub descriptor: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,
    pub settings: serde_json::Value,
}

impl OraclePayload {
    pub fn for_candidate(candidate: &Candidate, settings: serde_json::Value) -> Self {
        Self {
            candidate_id: candidate.id().clone(),
            descriptor: candidate.features().to_vec(),
            composition: candidate.formula().map(str::to_string),
            settings,
        }
    }

    pub fn fingerprint(&self) -> Result<String, OracleError> {
        fingerprint::fingerprint(self).map_err(|e| OracleError::Fingerprint(e.to_string()))
    }
}

/// A single request to the oracle, tracked by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    request_id: RequestId,
    candidate_id: CandidateId,
    attempt: u32,
    status: RequestStatus,
    settings_fingerprint: String,
    #[serde(default)]
    result: Option<f64>,
    #[serde(default)]
    result_fingerprint: Option<String>,
    #[serde(default)]
    failure: Option<FailureReason>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OracleRequest {
    /// Create a new pending request.
    pub fn new(candidate_id: CandidateId, settings_fingerprint: String, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            request_id: RequestId::derive(&candidate_id, &settings_fingerprint, attempt),
            candidate_id,
            attempt,
            status: RequestStatus::Pending,
            settings_fingerprint,
            result: None,
            result_fingerprint: None,
            failure: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn candidate_id(&self) -> &CandidateId {
        &self.candidate_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn settings_fingerprint(&self) -> &str {
        &self.settings_fingerprint
    }

    pub fn result(&self) -> Option<f64> {
        self.result
    }

    pub fn result_fingerprint(&self) -> Option<&str> {
        self.result_fingerprint.as_deref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }

    fn advance(&mut self, next: RequestStatus) -> Result<(), OracleError> {
        if !self.status.can_transition_to(next) {
            return Err(OracleError::InvalidTransition {
                current: self.status,
                requested: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the request as accepted by the backend.
    pub fn mark_queued(&mut self) -> Result<(), OracleError> {
        self.advance(RequestStatus::Queued)
    }

    /// Record a completed evaluation.
    ///
    /// The oracle's fingerprint is compared against the submitted settings
    /// fingerprint; on mismatch the request becomes `failed` and the result
    /// is discarded.
    pub fn complete(&mut self, result: f64, result_fingerprint: String) -> Result<(), OracleError> {
        if result_fingerprint != self.settings_fingerprint {
            let reason = FailureReason::IntegrityMismatch {
                expected: self.settings_fingerprint.clone(),
                actual: result_fingerprint.clone(),
            };
            self.result_fingerprint = Some(result_fingerprint);
            return self.fail(reason);
        }
        self.advance(RequestStatus::Completed)?;
        self.result = Some(result);
        self.result_fingerprint = Some(result_fingerprint);
        Ok(())
    }

    /// Record a failure.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), OracleError> {
        self.advance(RequestStatus::Failed)?;
        self.result = None;
        self.failure = Some(reason);
        Ok(())
    }
}
