//! File-based oracle backend.
//!
//! `submit` drops an input package for an external DFT workflow and `poll`
//! looks for the workflow's `results.json`. Nothing here waits on the
//! workflow itself.

use crate::error::{HandoffError, Result};
use crate::package::{
    to_pretty_json, HandoffResults, PackageMetadata, ResultStatus, DESCRIPTOR_JSON,
    METADATA_JSON, RESULTS_JSON, SETTINGS_JSON,
};
use async_trait::async_trait;
use chrono::Utc;
use qal_core::config::OracleConfig;
use qal_core::domain::{OracleError, RequestId};
use qal_core::gateway::{BackendReport, OracleBackend, Submission};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Oracle backend exchanging JSON packages through two directories.
#[derive(Debug, Clone)]
pub struct HandoffOracle {
    input_root: PathBuf,
    output_root: PathBuf,
    source_dataset: String,
}

impl HandoffOracle {
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        source_dataset: impl Into<String>,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            source_dataset: source_dataset.into(),
        }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        Self::new(
            &config.input_root,
            &config.output_root,
            config.source_dataset.clone(),
        )
    }

    pub fn input_dir(&self, request_id: &RequestId) -> PathBuf {
        self.input_root.join(request_id.as_str())
    }

    pub fn output_dir(&self, request_id: &RequestId) -> PathBuf {
        self.output_root.join(request_id.as_str())
    }

    async fn write_package(&self, submission: &Submission) -> Result<()> {
        ensure_path_safe(&submission.request_id)?;
        let final_dir = self.input_dir(&submission.request_id);
        if exists(&final_dir.join(METADATA_JSON)).await? {
            debug!(request_id = %submission.request_id, "handoff package already present");
            return Ok(());
        }

        // Stage under a dot-prefixed name so a watcher never sees half a package.
        let staging = self
            .input_root
            .join(format!(".{}.staging", submission.request_id));
        if exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| HandoffError::io(&staging, e))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| HandoffError::io(&staging, e))?;

        let payload = &submission.payload;
        let metadata = PackageMetadata {
            request_id: submission.request_id.clone(),
            candidate_id: payload.candidate_id.clone(),
            source_dataset: self.source_dataset.clone(),
            timestamp_utc: Utc::now(),
            composition: payload.composition.clone(),
            settings_fingerprint: submission.settings_fingerprint.clone(),
        };
        write_file(&staging.join(METADATA_JSON), &metadata).await?;
        write_file(&staging.join(DESCRIPTOR_JSON), &payload.descriptor).await?;
        write_file(&staging.join(SETTINGS_JSON), &payload.settings).await?;

        tokio::fs::rename(&staging, &final_dir)
            .await
            .map_err(|e| HandoffError::io(&final_dir, e))?;
        info!(
            request_id = %submission.request_id,
            dir = %final_dir.display(),
            "handoff package written"
        );
        Ok(())
    }

    async fn read_report(&self, request_id: &RequestId) -> Result<Option<BackendReport>> {
        ensure_path_safe(request_id)?;
        if !exists(&self.input_dir(request_id).join(METADATA_JSON)).await? {
            return Ok(None);
        }
        let results_path = self.output_dir(request_id).join(RESULTS_JSON);
        if !exists(&results_path).await? {
            return Ok(Some(BackendReport::Queued));
        }
        let raw = tokio::fs::read(&results_path)
            .await
            .map_err(|e| HandoffError::io(&results_path, e))?;
        let results: HandoffResults =
            serde_json::from_slice(&raw).map_err(|e| HandoffError::json(&results_path, e))?;
        Ok(Some(report_from_results(results)))
    }
}

fn report_from_results(results: HandoffResults) -> BackendReport {
    match results.status {
        ResultStatus::Queued | ResultStatus::Running => BackendReport::Queued,
        ResultStatus::Failed => BackendReport::Failed {
            message: results
                .error
                .unwrap_or_else(|| "workflow reported failure".to_string()),
        },
        ResultStatus::Completed => match (results.result, results.dft_settings_hash) {
            (Some(result), Some(settings_hash)) => BackendReport::Completed {
                result,
                settings_hash,
            },
            (None, _) => BackendReport::Failed {
                message: "results.json is completed but has no result".to_string(),
            },
            (Some(_), None) => BackendReport::Failed {
                message: "results.json is completed but has no dft_settings_hash".to_string(),
            },
        },
    }
}

fn ensure_path_safe(request_id: &RequestId) -> Result<()> {
    if request_id.is_path_safe() {
        Ok(())
    } else {
        Err(HandoffError::UnsafeRequestId(request_id.to_string()))
    }
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| HandoffError::io(path, e))
}

async fn write_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = to_pretty_json(value, path)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| HandoffError::io(path, e))
}

#[async_trait]
impl OracleBackend for HandoffOracle {
    async fn submit(&self, submission: &Submission) -> std::result::Result<(), OracleError> {
        tokio::fs::create_dir_all(&self.input_root)
            .await
            .map_err(|e| OracleError::io(self.input_root.display().to_string(), e))?;
        self.write_package(submission).await.map_err(Into::into)
    }

    async fn poll(&self, request_id: &RequestId) -> std::result::Result<BackendReport, OracleError> {
        match self.read_report(request_id).await {
            Ok(Some(report)) => Ok(report),
            Ok(None) => Err(OracleError::UnknownRequest(request_id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    fn name(&self) -> &'static str {
        "handoff"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(status: ResultStatus, result: Option<f64>, hash: Option<&str>) -> HandoffResults {
        HandoffResults {
            status,
            result,
            dft_settings_hash: hash.map(str::to_string),
            error: None,
        }
    }

    #[test]
    fn test_running_is_queued() {
        assert_eq!(
            report_from_results(results(ResultStatus::Running, None, None)),
            BackendReport::Queued
        );
    }

    #[test]
    fn test_completed_requires_result_and_hash() {
        assert_eq!(
            report_from_results(results(ResultStatus::Completed, Some(1.5), Some("ab"))),
            BackendReport::Completed {
                result: 1.5,
                settings_hash: "ab".to_string()
            }
        );
        assert!(matches!(
            report_from_results(results(ResultStatus::Completed, None, Some("ab"))),
            BackendReport::Failed { .. }
        ));
        assert!(matches!(
            report_from_results(results(ResultStatus::Completed, Some(1.5), None)),
            BackendReport::Failed { .. }
        ));
    }

    #[test]
    fn test_failed_keeps_workflow_message() {
        let mut failed = results(ResultStatus::Failed, None, None);
        failed.error = Some("scf diverged".to_string());
        assert_eq!(
            report_from_results(failed),
            BackendReport::Failed {
                message: "scf diverged".to_string()
            }
        );
    }
}
