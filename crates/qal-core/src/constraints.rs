//! Pre-filter applied before candidates enter the unlabeled pool.
//!
//! A rejection is a filtering decision recorded as an exclusion, never a run
//! failure.

use crate::domain::Candidate;
use crate::pool::{Exclusion, ExclusionReason};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static FORMULA_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([A-Z][a-z]?)([0-9.]*)").ok());

/// Decides whether a candidate may enter the pool.
pub trait CandidateFilter: Send + Sync {
    /// Issues found; empty means the candidate passes.
    fn check(&self, candidate: &Candidate) -> Vec<String>;
}

/// Composition rules for multi-principal-element alloys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionRules {
    /// Allowed element symbols. Empty allows every element.
    #[serde(default)]
    pub allowed_elements: BTreeSet<String>,

    #[serde(default = "default_min_unique")]
    pub min_unique_elements: usize,

    #[serde(default = "default_max_unique")]
    pub max_unique_elements: usize,

    #[serde(default)]
    pub min_atomic_fraction: f64,

    #[serde(default = "default_max_fraction")]
    pub max_atomic_fraction: f64,
}

fn default_min_unique() -> usize {
    1
}

fn default_max_unique() -> usize {
    118
}

fn default_max_fraction() -> f64 {
    1.0
}

impl Default for CompositionRules {
    fn default() -> Self {
        Self {
            allowed_elements: BTreeSet::new(),
            min_unique_elements: default_min_unique(),
            max_unique_elements: default_max_unique(),
            min_atomic_fraction: 0.0,
            max_atomic_fraction: default_max_fraction(),
        }
    }
}

/// Parse a formula such as `AlCoCrFeNi2.1` into normalised atomic fractions.
///
/// Missing amounts count as 1; repeated elements accumulate. Returns an empty
/// map when any character is not part of an element token, or the amounts
/// sum to zero.
pub fn parse_formula(formula: &str) -> BTreeMap<String, f64> {
    let Some(re) = FORMULA_TOKEN.as_ref() else {
        return BTreeMap::new();
    };
    let compact: String = formula.chars().filter(|c| !c.is_whitespace()).collect();

    let mut amounts: BTreeMap<String, f64> = BTreeMap::new();
    let mut covered = 0;
    for caps in re.captures_iter(&compact) {
        let Some(token) = caps.get(0) else {
            continue;
        };
        if token.start() != covered {
            return BTreeMap::new();
        }
        covered = token.end();
        let element = caps[1].to_string();
        let amount = match &caps[2] {
            "" => 1.0,
            raw => match raw.parse::<f64>() {
                Ok(v) => v,
                Err(_) => return BTreeMap::new(),
            },
        };
        *amounts.entry(element).or_insert(0.0) += amount;
    }
    if covered != compact.len() {
        return BTreeMap::new();
    }

    let total: f64 = amounts.values().sum();
    if total <= 0.0 {
        return BTreeMap::new();
    }
    for value in amounts.values_mut() {
        *value /= total;
    }
    amounts
}

impl CandidateFilter for CompositionRules {
    fn check(&self, candidate: &Candidate) -> Vec<String> {
        let Some(formula) = candidate.formula() else {
            return Vec::new();
        };
        let composition = parse_formula(formula);
        if composition.is_empty() {
            return vec![format!("unparseable formula {:?}", formula)];
        }

        let mut issues = Vec::new();
        let unique = composition.len();
        if unique < self.min_unique_elements || unique > self.max_unique_elements {
            issues.push(format!(
                "unique elements {} outside [{}, {}]",
                unique, self.min_unique_elements, self.max_unique_elements
            ));
        }
        if !self.allowed_elements.is_empty() {
            let disallowed: Vec<&str> = composition
                .keys()
                .filter(|e| !self.allowed_elements.contains(*e))
                .map(String::as_str)
                .collect();
            if !disallowed.is_empty() {
                issues.push(format!("disallowed elements: {}", disallowed.join(", ")));
            }
        }
        if let Some((element, fraction)) = composition.iter().find(|(_, f)| {
            **f < self.min_atomic_fraction || **f > self.max_atomic_fraction
        }) {
            issues.push(format!(
                "element {} fraction {:.3} outside [{}, {}]",
                element, fraction, self.min_atomic_fraction, self.max_atomic_fraction
            ));
        }
        issues
    }
}

/// Split candidates into those that pass `filter` and exclusions for the rest.
pub fn apply_filter(
    candidates: Vec<Candidate>,
    filter: &dyn CandidateFilter,
) -> (Vec<Candidate>, Vec<Exclusion>) {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut excluded = Vec::new();
    for candidate in candidates {
        let issues = filter.check(&candidate);
        if issues.is_empty() {
            kept.push(candidate);
        } else {
            excluded.push(Exclusion {
                candidate_id: candidate.id().clone(),
                reason: ExclusionReason::ConstraintViolation { issues },
            });
        }
    }
    (kept, excluded)
}
