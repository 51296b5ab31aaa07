//! Candidates and labeled examples.

use serde::{Deserialize, Serialize};

/// Stable identifier of a candidate material.
///
/// Ordering is lexicographic and is the tie-break order for batch selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> Self {
        CandidateId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a single directory entry.
    ///
    /// Request ids embed the candidate id and the handoff backend uses them
    /// as directory names.
    pub fn is_path_safe(&self) -> bool {
        is_path_component(&self.0)
    }
}

/// Non-empty, not hidden, no parent reference, no separators or NULs.
pub(crate) fn is_path_component(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && !s.contains("..") && !s.contains(['/', '\\', '\0'])
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(s: &str) -> Self {
        CandidateId(s.to_string())
    }
}

impl From<String> for CandidateId {
    fn from(s: String) -> Self {
        CandidateId(s)
    }
}

/// A candidate material: identifier plus fixed-length feature vector.
///
/// Created once at pool initialization and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    id: CandidateId,
    features: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
}

impl Candidate {
    pub fn new(id: impl Into<CandidateId>, features: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            features,
            formula: None,
        }
    }

    /// Attach a chemical formula used by composition filters and oracle payloads.
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn id(&self) -> &CandidateId {
        &self.id
    }

    pub fn features(&self) -> &[f64] {
        &self.features
    }

    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref()
    }

    pub fn dim(&self) -> usize {
        self.features.len()
    }
}

/// Where a label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Origin {
    /// Bootstrap label supplied before the first round.
    Seed,
    /// Label returned by the oracle during the given round.
    Acquired { iteration: u64 },
}

/// A candidate together with its label and provenance.
///
/// Owned by the pool store; appended, never edited or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub candidate: Candidate,
    pub label: f64,
    pub origin: Origin,
}

impl LabeledExample {
    pub fn id(&self) -> &CandidateId {
        self.candidate.id()
    }

    pub fn is_seed(&self) -> bool {
        self.origin == Origin::Seed
    }
}
