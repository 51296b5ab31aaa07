//! Pool store: the labeled / unlabeled partition of candidates.
//!
//! Invariants:
//! - `labeled ∩ unlabeled = ∅` at every observable point.
//! - `promote` moves one candidate from unlabeled to labeled and preserves
//!   `|labeled| + |unlabeled| + |excluded|`.
//! - The total only changes through explicit exclusion.
//!
//! Mutation goes through `&mut self`, so a single controller task is the only
//! writer. A concurrent-dispatch extension would need a per-id compare-and-swap
//! around `promote` to keep the at-most-one-label guarantee.

use crate::domain::{Candidate, CandidateId, LabeledExample, Origin, PoolError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Why a candidate was removed from consideration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Features were malformed (wrong dimension, non-finite values, duplicate id).
    Malformed { message: String },
    /// The constraint pre-filter rejected the candidate.
    ConstraintViolation { issues: Vec<String> },
    /// The configured oracle has no way to label the candidate.
    Unlabelable { message: String },
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::Malformed { message } => write!(f, "malformed: {}", message),
            ExclusionReason::ConstraintViolation { issues } => {
                write!(f, "constraint violation: {}", issues.join("; "))
            }
            ExclusionReason::Unlabelable { message } => write!(f, "unlabelable: {}", message),
        }
    }
}

/// A candidate that was excluded from the pool, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub candidate_id: CandidateId,
    pub reason: ExclusionReason,
}

/// Owns every candidate and labeled example for the lifetime of a run.
#[derive(Debug, Default)]
pub struct PoolStore {
    unlabeled: BTreeMap<CandidateId, Candidate>,
    labeled: Vec<LabeledExample>,
    labeled_index: HashMap<CandidateId, usize>,
    excluded: Vec<Exclusion>,
    dim: Option<usize>,
}

impl PoolStore {
    /// Build a pool from candidates.
    ///
    /// The first candidate fixes the feature dimension. Candidates with a
    /// different dimension, non-finite features or a repeated id are
    /// excluded with a logged reason instead of failing the run.
    pub fn new(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        let mut pool = PoolStore::default();
        for candidate in candidates {
            pool.admit(candidate);
        }
        pool
    }

    fn admit(&mut self, candidate: Candidate) {
        let id = candidate.id().clone();
        let problem = if self.unlabeled.contains_key(&id) || self.labeled_index.contains_key(&id) {
            Some("duplicate candidate id".to_string())
        } else if candidate.features().is_empty() {
            Some("empty feature vector".to_string())
        } else if candidate.features().iter().any(|v| !v.is_finite()) {
            Some("non-finite feature value".to_string())
        } else {
            match self.dim {
                Some(dim) if dim != candidate.dim() => Some(format!(
                    "feature dimension {} does not match pool dimension {}",
                    candidate.dim(),
                    dim
                )),
                _ => None,
            }
        };

        match problem {
            Some(message) => self.record_exclusion(Exclusion {
                candidate_id: id,
                reason: ExclusionReason::Malformed { message },
            }),
            None => {
                self.dim.get_or_insert(candidate.dim());
                self.unlabeled.insert(id, candidate);
            }
        }
    }

    /// Record a candidate rejected before it ever entered the pool.
    pub fn record_exclusion(&mut self, exclusion: Exclusion) {
        crate::obs::emit_candidate_excluded(exclusion.candidate_id.as_str(), &exclusion.reason);
        self.excluded.push(exclusion);
    }

    /// Remove an unlabeled candidate from consideration.
    pub fn exclude(&mut self, id: &CandidateId, reason: ExclusionReason) -> Result<(), PoolError> {
        if self.labeled_index.contains_key(id) {
            return Err(PoolError::AlreadyLabeled(id.clone()));
        }
        if self.unlabeled.remove(id).is_none() {
            return Err(PoolError::NotFound(id.clone()));
        }
        self.record_exclusion(Exclusion {
            candidate_id: id.clone(),
            reason,
        });
        Ok(())
    }

    /// Bootstrap the labeled set.
    ///
    /// All ids are checked before any is promoted, so a failing seed leaves
    /// the pool untouched.
    pub fn seed(&mut self, ids: &[CandidateId], labels: &[f64]) -> Result<(), PoolError> {
        if ids.len() != labels.len() {
            return Err(PoolError::SeedLengthMismatch {
                ids: ids.len(),
                labels: labels.len(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            self.check_promotable(id)?;
            if !seen.insert(id) {
                return Err(PoolError::AlreadyLabeled(id.clone()));
            }
        }
        for (id, label) in ids.iter().zip(labels) {
            self.promote(id, *label, Origin::Seed)?;
        }
        Ok(())
    }

    fn check_promotable(&self, id: &CandidateId) -> Result<(), PoolError> {
        if self.labeled_index.contains_key(id) {
            return Err(PoolError::AlreadyLabeled(id.clone()));
        }
        if !self.unlabeled.contains_key(id) {
            return Err(PoolError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// Move a candidate from unlabeled to labeled.
    pub fn promote(
        &mut self,
        id: &CandidateId,
        label: f64,
        origin: Origin,
    ) -> Result<&LabeledExample, PoolError> {
        self.check_promotable(id)?;
        let candidate = self
            .unlabeled
            .remove(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;

        let index = self.labeled.len();
        self.labeled.push(LabeledExample {
            candidate,
            label,
            origin,
        });
        self.labeled_index.insert(id.clone(), index);
        Ok(&self.labeled[index])
    }

    pub fn labeled(&self) -> &[LabeledExample] {
        &self.labeled
    }

    /// Unlabeled candidates in ascending id order.
    pub fn unlabeled(&self) -> impl Iterator<Item = &Candidate> {
        self.unlabeled.values()
    }

    pub fn get_unlabeled(&self, id: &CandidateId) -> Option<&Candidate> {
        self.unlabeled.get(id)
    }

    pub fn is_labeled(&self, id: &CandidateId) -> bool {
        self.labeled_index.contains_key(id)
    }

    pub fn is_unlabeled(&self, id: &CandidateId) -> bool {
        self.unlabeled.contains_key(id)
    }

    pub fn excluded(&self) -> &[Exclusion] {
        &self.excluded
    }

    pub fn labeled_len(&self) -> usize {
        self.labeled.len()
    }

    pub fn unlabeled_len(&self) -> usize {
        self.unlabeled.len()
    }

    /// `|labeled| + |unlabeled| + |excluded|`.
    pub fn total(&self) -> usize {
        self.labeled.len() + self.unlabeled.len() + self.excluded.len()
    }

    /// Feature dimension fixed by the first admitted candidate.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Labels of the seed set.
    pub fn seed_len(&self) -> usize {
        self.labeled.iter().filter(|ex| ex.is_seed()).count()
    }
}
