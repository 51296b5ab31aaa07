//! Handoff package validation.
//!
//! Checks each `<input_root>/<request_id>` package against its
//! `<output_root>/<request_id>` counterpart: required files, metadata fields,
//! and that the workflow echoed the settings fingerprint it was given.

use crate::error::{HandoffError, Result};
use crate::package::{
    package_digest, payload_from_parts, read_json, HandoffResults, PackageMetadata,
    DESCRIPTOR_JSON, METADATA_JSON, REQUIRED_INPUT_FILES, REQUIRED_METADATA_FIELDS,
    REQUIRED_OUTPUT_FILES, RESULTS_JSON, SETTINGS_JSON,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Findings for one request directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageReport {
    pub request_id: String,
    pub input_valid: bool,
    pub output_valid: bool,
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_digest: Option<String>,
}

/// Aggregate over every package under an input root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffValidationSummary {
    pub total_packages: usize,
    pub input_valid: usize,
    pub output_valid: usize,
    pub reports: Vec<PackageReport>,
}

impl HandoffValidationSummary {
    pub fn all_valid(&self) -> bool {
        self.input_valid == self.total_packages && self.output_valid == self.total_packages
    }
}

/// Validate one input package against its output directory.
///
/// Never fails: every problem becomes an issue on the report.
pub fn validate_package(input_dir: &Path, output_dir: &Path) -> PackageReport {
    let mut issues = Vec::new();
    let mut input_valid = true;
    let mut output_valid = true;
    let mut request_id = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for name in REQUIRED_INPUT_FILES {
        if !input_dir.join(name).exists() {
            issues.push(format!("Missing input file: {}", name));
            input_valid = false;
        }
    }

    let mut expected_hash = None;
    let metadata_path = input_dir.join(METADATA_JSON);
    if metadata_path.exists() {
        match read_json::<serde_json::Value>(&metadata_path) {
            Ok(raw) => {
                if let Some(id) = raw.get("request_id").and_then(|v| v.as_str()) {
                    request_id = id.to_string();
                }
                for field in REQUIRED_METADATA_FIELDS {
                    if raw.get(field).is_none() {
                        issues.push(format!("Metadata missing field: {}", field));
                        input_valid = false;
                    }
                }
                if input_valid {
                    match check_fingerprint(input_dir, raw) {
                        Ok(hash) => expected_hash = Some(hash),
                        Err(issue) => {
                            issues.push(issue);
                            input_valid = false;
                        }
                    }
                }
            }
            Err(err) => {
                issues.push(err.to_string());
                input_valid = false;
            }
        }
    }

    let digest = if input_valid {
        package_digest(input_dir).ok()
    } else {
        None
    };

    for name in REQUIRED_OUTPUT_FILES {
        if !output_dir.join(name).exists() {
            issues.push(format!("Missing output file: {}", name));
            output_valid = false;
        }
    }

    let results_path = output_dir.join(RESULTS_JSON);
    if results_path.exists() {
        match read_json::<HandoffResults>(&results_path) {
            Ok(results) => {
                if let Some(expected) = &expected_hash {
                    if results.dft_settings_hash.as_deref() != Some(expected.as_str()) {
                        issues.push("dft_settings_hash mismatch".to_string());
                        output_valid = false;
                    }
                }
            }
            Err(err) => {
                issues.push(err.to_string());
                output_valid = false;
            }
        }
    }

    debug!(
        request_id = %request_id,
        input_valid,
        output_valid,
        issues = issues.len(),
        "handoff package checked"
    );
    PackageReport {
        request_id,
        input_valid,
        output_valid,
        issues,
        package_digest: digest,
    }
}

/// Recompute the payload fingerprint from the package files and compare it
/// with the one recorded in the metadata. Returns the recorded fingerprint.
fn check_fingerprint(
    input_dir: &Path,
    raw_metadata: serde_json::Value,
) -> std::result::Result<String, String> {
    let metadata: PackageMetadata = serde_json::from_value(raw_metadata)
        .map_err(|e| format!("Metadata malformed: {}", e))?;
    let descriptor: Vec<f64> =
        read_json(&input_dir.join(DESCRIPTOR_JSON)).map_err(|e| e.to_string())?;
    let settings: serde_json::Value =
        read_json(&input_dir.join(SETTINGS_JSON)).map_err(|e| e.to_string())?;

    let recomputed = payload_from_parts(&metadata, descriptor, settings)
        .fingerprint()
        .map_err(|e| e.to_string())?;
    if recomputed != metadata.settings_fingerprint {
        return Err("settings_fingerprint does not match package contents".to_string());
    }
    Ok(metadata.settings_fingerprint)
}

/// Validate every package directory under `input_root`, in name order.
pub fn validate_handoff(input_root: &Path, output_root: &Path) -> Result<HandoffValidationSummary> {
    if !input_root.is_dir() {
        return Err(HandoffError::RootNotFound(input_root.to_path_buf()));
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(input_root).map_err(|e| HandoffError::io(input_root, e))? {
        let entry = entry.map_err(|e| HandoffError::io(input_root, e))?;
        let path = entry.path();
        let staging = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !staging {
            dirs.push(path);
        }
    }
    dirs.sort();

    let reports: Vec<PackageReport> = dirs
        .iter()
        .map(|dir| {
            let name = dir.file_name().unwrap_or_default();
            validate_package(dir, &output_root.join(name))
        })
        .collect();

    let summary = HandoffValidationSummary {
        total_packages: reports.len(),
        input_valid: reports.iter().filter(|r| r.input_valid).count(),
        output_valid: reports.iter().filter(|r| r.output_valid).count(),
        reports,
    };
    info!(
        total = summary.total_packages,
        input_valid = summary.input_valid,
        output_valid = summary.output_valid,
        "handoff validation finished"
    );
    Ok(summary)
}

/// Write the summary as pretty JSON, creating parent directories.
pub fn write_validation_report(path: &Path, summary: &HandoffValidationSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
