//! Run report persisted once per run under `<output_dir>/<run_id>/`.
//!
//! Rerunning with the same run id overwrites both files. An aborted run
//! writes `aborted.json` instead, keeping the rounds it completed.

use crate::controller::{RunAborted, RunOutcome};
use crate::domain::{IterationRecord, OracleRequest, RunSummary};
use crate::pool::Exclusion;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";
pub const SUMMARY_JSON: &str = "run_summary.json";
pub const SUMMARY_MD: &str = "run_summary.md";
pub const ABORTED_JSON: &str = "aborted.json";

/// Structured run report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub history: Vec<IterationRecord>,
    pub outstanding_requests: Vec<OracleRequest>,
    pub excluded: Vec<Exclusion>,
}

impl RunReport {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            summary: outcome.summary.clone(),
            history: outcome.history.clone(),
            outstanding_requests: outcome.outstanding.clone(),
            excluded: outcome.excluded.clone(),
        }
    }
}

/// Render the markdown companion of the report.
pub fn render_run_summary_md(report: &RunReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    out.push_str(&format!("# Run Summary: {}\n\n", s.run_id));
    out.push_str(&format!(
        "- strategy: {}\n- termination: {}\n- iterations: {}\n",
        s.strategy, s.termination, s.iterations_completed
    ));
    match s.final_rmse {
        Some(rmse) => out.push_str(&format!("- final RMSE: {:.6}\n", rmse)),
        None => out.push_str("- final RMSE: n/a\n"),
    }
    out.push_str(&format!(
        "- labels: {} (seed {}, acquired {})\n",
        s.cumulative_labels, s.seed_labels, s.acquired_labels
    ));
    if let (Some(target), Some(labels)) = (s.target_rmse, s.labels_to_target) {
        out.push_str(&format!("- labels to reach RMSE {}: {}\n", target, labels));
    }
    out.push_str(&format!(
        "- label-efficiency gain vs {} baseline labels: {:.1}%\n\n",
        s.baseline_label_budget,
        s.label_efficiency_gain * 100.0
    ));

    if !report.history.is_empty() {
        out.push_str("## Iterations\n\n");
        out.push_str("| iteration | labeled | unlabeled | RMSE | mean std | completed | queued | failed |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for r in &report.history {
            out.push_str(&format!(
                "| {} | {} | {} | {:.6} | {:.4} | {} | {} | {} |\n",
                r.iteration, r.labeled, r.unlabeled, r.rmse, r.mean_std, r.completed, r.queued, r.failed
            ));
        }
        out.push('\n');
    }

    if !report.outstanding_requests.is_empty() {
        out.push_str(&format!(
            "## Outstanding Requests ({})\n\n",
            report.outstanding_requests.len()
        ));
        for r in &report.outstanding_requests {
            out.push_str(&format!("- `{}` ({})\n", r.request_id(), r.status()));
        }
        out.push('\n');
    }

    if !report.excluded.is_empty() {
        out.push_str(&format!("## Excluded Candidates ({})\n\n", report.excluded.len()));
        for e in &report.excluded {
            out.push_str(&format!("- `{}`: {}\n", e.candidate_id, e.reason));
        }
    }
    out
}

/// What survives a fatal abort: no summary, only the completed rounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbortedReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub phase: String,
    pub cause: String,
    pub history: Vec<IterationRecord>,
}

impl AbortedReport {
    pub fn from_aborted(run_id: &str, aborted: &RunAborted) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            run_id: run_id.to_string(),
            phase: aborted.phase.to_string(),
            cause: aborted.cause.to_string(),
            history: aborted.history.clone(),
        }
    }
}

/// Write `aborted.json` into `run_dir` and return its path.
pub fn write_aborted_report(run_dir: &Path, report: &AbortedReport) -> Result<PathBuf> {
    std::fs::create_dir_all(run_dir).with_context(|| format!("create {:?}", run_dir))?;
    let path = run_dir.join(ABORTED_JSON);
    let content = serde_json::to_string_pretty(report).context("serialize aborted report")?;
    std::fs::write(&path, content).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

/// Write `run_summary.json` and `run_summary.md` into `run_dir`.
///
/// Returns the path of the JSON report.
pub fn write_run_report(run_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(run_dir).with_context(|| format!("create {:?}", run_dir))?;

    let json_path = run_dir.join(SUMMARY_JSON);
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(&json_path, content).with_context(|| format!("write {:?}", json_path))?;

    let md_path = run_dir.join(SUMMARY_MD);
    std::fs::write(&md_path, render_run_summary_md(report))
        .with_context(|| format!("write {:?}", md_path))?;
    Ok(json_path)
}

/// Load a previously written report.
pub fn read_run_report(path: &Path) -> Result<RunReport> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {:?}", path))
}
