//! On-disk layout of a handoff package.
//!
//! ```text
//! <input_root>/<request_id>/metadata.json
//!                           descriptor.json
//!                           settings.json
//! <output_root>/<request_id>/results.json
//! ```

use crate::error::{HandoffError, Result};
use chrono::{DateTime, Utc};
use qal_core::domain::{CandidateId, OraclePayload, RequestId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const METADATA_JSON: &str = "metadata.json";
pub const DESCRIPTOR_JSON: &str = "descriptor.json";
pub const SETTINGS_JSON: &str = "settings.json";
pub const RESULTS_JSON: &str = "results.json";

/// Files every input package must contain.
pub const REQUIRED_INPUT_FILES: [&str; 3] = [METADATA_JSON, DESCRIPTOR_JSON, SETTINGS_JSON];

/// Files every output package must contain.
pub const REQUIRED_OUTPUT_FILES: [&str; 1] = [RESULTS_JSON];

/// Metadata fields the validator requires.
pub const REQUIRED_METADATA_FIELDS: [&str; 3] = ["source_dataset", "timestamp_utc", "composition"];

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub request_id: RequestId,
    pub candidate_id: CandidateId,
    pub source_dataset: String,
    pub timestamp_utc: DateTime<Utc>,
    pub composition: Option<String>,
    pub settings_fingerprint: String,
}

/// Status written by the DFT workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Contents of `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffResults {
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Option<f64>,
    #[serde(default)]
    pub dft_settings_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rebuild the submitted payload from the package files.
pub fn payload_from_parts(
    metadata: &PackageMetadata,
    descriptor: Vec<f64>,
    settings: serde_json::Value,
) -> OraclePayload {
    OraclePayload {
        candidate_id: metadata.candidate_id.clone(),
        descriptor,
        composition: metadata.composition.clone(),
        settings,
    }
}

/// SHA-256 over the required input files, each prefixed by its name.
pub fn package_digest(input_dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for name in REQUIRED_INPUT_FILES {
        let path = input_dir.join(name);
        let bytes = std::fs::read(&path).map_err(|e| HandoffError::io(&path, e))?;
        hasher.update(format!("{}\n", name).as_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).map_err(|e| HandoffError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| HandoffError::json(path, e))
}

pub(crate) fn to_pretty_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| HandoffError::json(path, e))
}
