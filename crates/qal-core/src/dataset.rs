//! Candidate table ingestion and the seeded evaluation / seed / pool split.
//!
//! Input is JSON Lines, one candidate per line:
//!
//! ```text
//! {"id": "mp-149", "features": [0.1, 2.3], "label": -0.42, "formula": "AlCoCrFeNi"}
//! ```
//!
//! `label` and `formula` are optional. Bad rows become exclusions; only an
//! unreadable file or too few labeled rows fail the load.

use crate::constraints::{apply_filter, CandidateFilter};
use crate::domain::{Candidate, CandidateId, DataError};
use crate::pool::{Exclusion, ExclusionReason};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawRow {
    id: String,
    features: Vec<f64>,
    #[serde(default)]
    label: Option<f64>,
    #[serde(default)]
    formula: Option<String>,
}

/// A parsed, validated candidate table.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    candidates: Vec<Candidate>,
    labels: HashMap<CandidateId, f64>,
    excluded: Vec<Exclusion>,
}

/// Held-out slice, seed set and remaining pool for one run.
#[derive(Debug, Clone)]
pub struct Split {
    /// Evaluation slice; never enters the pool.
    pub eval: Vec<(Candidate, f64)>,
    pub seed_ids: Vec<CandidateId>,
    pub seed_labels: Vec<f64>,
    /// Every non-evaluation candidate, seed rows included.
    pub pool: Vec<Candidate>,
    /// Known labels of pool candidates, for simulated oracles.
    pub truth: HashMap<CandidateId, f64>,
    pub excluded: Vec<Exclusion>,
}

fn malformed(id: impl Into<CandidateId>, message: impl Into<String>) -> Exclusion {
    Exclusion {
        candidate_id: id.into(),
        reason: ExclusionReason::Malformed {
            message: message.into(),
        },
    }
}

impl Dataset {
    /// Read a JSONL file.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let file = std::fs::File::open(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(std::io::BufReader::new(file)).map_err(|e| match e {
            DataError::Io { source, .. } => DataError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse JSONL from any reader. Blank lines are skipped.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, DataError> {
        let mut dataset = Dataset::default();
        let mut seen = HashSet::new();
        let mut dim = None;

        for (index, line) in reader.lines().enumerate() {
            let line_no = index + 1;
            let line = line.map_err(|source| DataError::Io {
                path: Default::default(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row: RawRow = match serde_json::from_str(&line) {
                Ok(row) => row,
                Err(e) => {
                    let err = DataError::Parse {
                        line: line_no,
                        message: e.to_string(),
                    };
                    dataset.excluded.push(malformed(format!("line-{}", line_no), err.to_string()));
                    continue;
                }
            };

            let problem = if !seen.insert(row.id.clone()) {
                Some("duplicate candidate id".to_string())
            } else if !CandidateId::new(row.id.as_str()).is_path_safe() {
                Some("candidate id is not usable as a file name".to_string())
            } else if row.features.is_empty() {
                Some("empty feature vector".to_string())
            } else if row.features.iter().any(|v| !v.is_finite()) {
                Some("non-finite feature value".to_string())
            } else if row.label.is_some_and(|l| !l.is_finite()) {
                Some("non-finite label".to_string())
            } else {
                match dim {
                    Some(d) if d != row.features.len() => Some(format!(
                        "feature dimension {} does not match table dimension {}",
                        row.features.len(),
                        d
                    )),
                    _ => None,
                }
            };
            if let Some(reason) = problem {
                let err = DataError::Malformed {
                    id: row.id.clone(),
                    reason,
                };
                dataset.excluded.push(malformed(row.id, err.to_string()));
                continue;
            }

            dim.get_or_insert(row.features.len());
            let mut candidate = Candidate::new(row.id, row.features);
            if let Some(formula) = row.formula {
                candidate = candidate.with_formula(formula);
            }
            if let Some(label) = row.label {
                dataset.labels.insert(candidate.id().clone(), label);
            }
            dataset.candidates.push(candidate);
        }
        Ok(dataset)
    }

    /// Build a dataset from in-memory rows.
    pub fn from_rows(rows: impl IntoIterator<Item = (Candidate, Option<f64>)>) -> Self {
        let mut dataset = Dataset::default();
        for (candidate, label) in rows {
            if let Some(label) = label {
                dataset.labels.insert(candidate.id().clone(), label);
            }
            dataset.candidates.push(candidate);
        }
        dataset
    }

    /// Move candidates rejected by `filter` into the exclusion list.
    pub fn filter(mut self, filter: &dyn CandidateFilter) -> Self {
        let (kept, rejected) = apply_filter(std::mem::take(&mut self.candidates), filter);
        for exclusion in &rejected {
            self.labels.remove(&exclusion.candidate_id);
        }
        self.candidates = kept;
        self.excluded.extend(rejected);
        self
    }

    /// Move rows without a label into the exclusion list.
    ///
    /// Used when the oracle answers from the table itself and so can never
    /// label such a row.
    pub fn require_labels(mut self, message: &str) -> Self {
        let (kept, dropped): (Vec<Candidate>, Vec<Candidate>) =
            std::mem::take(&mut self.candidates)
                .into_iter()
                .partition(|c| self.labels.contains_key(c.id()));
        self.candidates = kept;
        self.excluded.extend(dropped.into_iter().map(|c| Exclusion {
            candidate_id: c.id().clone(),
            reason: ExclusionReason::Unlabelable {
                message: message.to_string(),
            },
        }));
        self
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn excluded(&self) -> &[Exclusion] {
        &self.excluded
    }

    pub fn labeled_count(&self) -> usize {
        self.labels.len()
    }

    /// Shuffle labeled rows with `seed`, take the evaluation slice, then the
    /// seed set; everything else (labeled or not) becomes the pool.
    pub fn split(self, eval_size: usize, seed_size: usize, seed: u64) -> Result<Split, DataError> {
        let needed = eval_size + seed_size;
        let mut labeled: Vec<CandidateId> = self
            .candidates
            .iter()
            .filter(|c| self.labels.contains_key(c.id()))
            .map(|c| c.id().clone())
            .collect();
        if labeled.len() < needed {
            return Err(DataError::InsufficientLabeled {
                needed,
                found: labeled.len(),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        labeled.shuffle(&mut rng);
        let eval_ids: HashSet<CandidateId> = labeled[..eval_size].iter().cloned().collect();
        let seed_ids: Vec<CandidateId> = labeled[eval_size..needed].to_vec();

        let mut eval = Vec::with_capacity(eval_size);
        let mut pool = Vec::with_capacity(self.candidates.len() - eval_size);
        let mut truth = HashMap::new();
        for candidate in self.candidates {
            let label = self.labels.get(candidate.id()).copied();
            match label {
                Some(label) if eval_ids.contains(candidate.id()) => eval.push((candidate, label)),
                _ => {
                    if let Some(label) = label {
                        truth.insert(candidate.id().clone(), label);
                    }
                    pool.push(candidate);
                }
            }
        }
        // Keep the evaluation slice in a stable order independent of the shuffle.
        eval.sort_by(|a, b| a.0.id().cmp(b.0.id()));
        let seed_labels = seed_ids
            .iter()
            .filter_map(|id| truth.get(id).copied())
            .collect();

        Ok(Split {
            eval,
            seed_ids,
            seed_labels,
            pool,
            truth,
            excluded: self.excluded,
        })
    }
}
