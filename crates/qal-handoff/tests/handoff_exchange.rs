//! End-to-end exchange between the gateway and a directory-based workflow.

use qal_core::domain::{Candidate, FailureReason, OracleError, RequestId, RequestStatus};
use qal_core::gateway::{OracleBackend, OracleGateway};
use qal_handoff::package::{DESCRIPTOR_JSON, METADATA_JSON, RESULTS_JSON, SETTINGS_JSON};
use qal_handoff::{
    validate_handoff, write_validation_report, HandoffError, HandoffOracle, PackageMetadata,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Exchange {
    _dir: TempDir,
    input_root: PathBuf,
    output_root: PathBuf,
    oracle: Arc<HandoffOracle>,
}

fn exchange() -> Exchange {
    let dir = tempfile::tempdir().unwrap();
    let input_root = dir.path().join("inputs");
    let output_root = dir.path().join("outputs");
    let oracle = Arc::new(HandoffOracle::new(&input_root, &output_root, "mp-2024"));
    Exchange {
        _dir: dir,
        input_root,
        output_root,
        oracle,
    }
}

fn gateway(ex: &Exchange) -> OracleGateway {
    OracleGateway::new(
        ex.oracle.clone(),
        serde_json::json!({ "code": "VASP", "encut": 520, "kpoints": [4, 4, 4] }),
    )
}

fn candidate(id: &str) -> Candidate {
    Candidate::new(id, vec![0.5, 0.25, -1.0]).with_formula("LiFePO4")
}

fn metadata(ex: &Exchange, rid: &RequestId) -> PackageMetadata {
    let raw = std::fs::read(ex.input_root.join(rid.as_str()).join(METADATA_JSON)).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

/// Play the external workflow: write `results.json` for a request.
fn finish(output_root: &Path, rid: &RequestId, body: serde_json::Value) {
    let dir = output_root.join(rid.as_str());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(RESULTS_JSON), body.to_string()).unwrap();
}

#[tokio::test]
async fn submit_writes_a_complete_package() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let request = gw.submit(&candidate("mp-19017")).await.unwrap();
    assert_eq!(request.status(), RequestStatus::Queued);

    let dir = ex.input_root.join(request.request_id().as_str());
    for name in [METADATA_JSON, DESCRIPTOR_JSON, SETTINGS_JSON] {
        assert!(dir.join(name).exists(), "{} missing", name);
    }
    let meta = metadata(&ex, request.request_id());
    assert_eq!(meta.request_id, *request.request_id());
    assert_eq!(meta.candidate_id.as_str(), "mp-19017");
    assert_eq!(meta.source_dataset, "mp-2024");
    assert_eq!(meta.composition.as_deref(), Some("LiFePO4"));
    assert_eq!(meta.settings_fingerprint, request.settings_fingerprint());

    let staged: Vec<_> = std::fs::read_dir(&ex.input_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(staged.is_empty());
}

#[tokio::test]
async fn resubmitting_keeps_the_existing_package() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let request = gw.submit(&candidate("mp-1")).await.unwrap();
    let first = metadata(&ex, request.request_id());

    // A restarted process offers the same request id straight to the backend.
    let submission = qal_core::gateway::Submission {
        request_id: request.request_id().clone(),
        settings_fingerprint: request.settings_fingerprint().to_string(),
        payload: qal_core::domain::OraclePayload::for_candidate(
            &candidate("mp-1"),
            serde_json::json!({}),
        ),
    };
    ex.oracle.submit(&submission).await.unwrap();
    assert_eq!(metadata(&ex, request.request_id()), first);
}

#[tokio::test]
async fn results_flow_back_through_the_gateway() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let request = gw.submit(&candidate("mp-2")).await.unwrap();
    let rid = request.request_id().clone();

    let polled = gw.poll(&rid).await.unwrap();
    assert_eq!(polled.status(), RequestStatus::Queued);

    finish(
        &ex.output_root,
        &rid,
        serde_json::json!({ "status": "running" }),
    );
    assert_eq!(gw.poll(&rid).await.unwrap().status(), RequestStatus::Queued);

    finish(
        &ex.output_root,
        &rid,
        serde_json::json!({
            "status": "completed",
            "result": -2.75,
            "dft_settings_hash": request.settings_fingerprint(),
        }),
    );
    let done = gw.poll(&rid).await.unwrap();
    assert_eq!(done.status(), RequestStatus::Completed);
    assert_eq!(done.result(), Some(-2.75));
}

#[tokio::test]
async fn foreign_settings_hash_is_rejected() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let request = gw.submit(&candidate("mp-3")).await.unwrap();
    let rid = request.request_id().clone();
    finish(
        &ex.output_root,
        &rid,
        serde_json::json!({ "status": "completed", "result": 1.0, "dft_settings_hash": "0".repeat(64) }),
    );

    let polled = gw.poll(&rid).await.unwrap();
    assert_eq!(polled.status(), RequestStatus::Failed);
    assert_eq!(polled.result(), None);
    assert!(matches!(
        polled.failure(),
        Some(FailureReason::IntegrityMismatch { .. })
    ));
}

#[tokio::test]
async fn workflow_failure_is_an_evaluation_failure() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let rid = gw.submit(&candidate("mp-4")).await.unwrap().request_id().clone();
    finish(
        &ex.output_root,
        &rid,
        serde_json::json!({ "status": "failed", "error": "electronic loop did not converge" }),
    );
    let polled = gw.poll(&rid).await.unwrap();
    assert_eq!(
        polled.failure(),
        Some(&FailureReason::Evaluation {
            message: "electronic loop did not converge".to_string()
        })
    );
}

#[tokio::test]
async fn backend_poll_errors() {
    let ex = exchange();
    let unknown = RequestId::derive(&"mp-404".into(), "00", 0);
    assert!(matches!(
        ex.oracle.poll(&unknown).await,
        Err(OracleError::UnknownRequest(_))
    ));

    let mut gw = gateway(&ex);
    let rid = gw.submit(&candidate("mp-5")).await.unwrap().request_id().clone();
    let dir = ex.output_root.join(rid.as_str());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(RESULTS_JSON), "{\"status\": \"comp").unwrap();
    assert!(matches!(
        ex.oracle.poll(&rid).await,
        Err(OracleError::Backend(_))
    ));
    // The gateway keeps the request in flight.
    assert_eq!(gw.poll(&rid).await.unwrap().status(), RequestStatus::Queued);
}

#[tokio::test]
async fn request_ids_cannot_leave_the_roots() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let request = gw.submit(&candidate("../escaped")).await.unwrap();
    assert_eq!(request.status(), RequestStatus::Failed);
    assert!(matches!(request.failure(), Some(FailureReason::Rejected { .. })));

    let parent = ex.input_root.parent().unwrap();
    let escaped: Vec<_> = std::fs::read_dir(parent)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("escaped"))
        .collect();
    assert!(escaped.is_empty());

    assert!(matches!(
        ex.oracle.poll(request.request_id()).await,
        Err(OracleError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn validator_reports_per_package() {
    let ex = exchange();
    let mut gw = gateway(&ex);
    let good = gw.submit(&candidate("mp-10")).await.unwrap();
    let missing = gw.submit(&candidate("mp-11")).await.unwrap();
    let tampered = gw.submit(&candidate("mp-12")).await.unwrap();

    finish(
        &ex.output_root,
        good.request_id(),
        serde_json::json!({ "status": "completed", "result": 0.1, "dft_settings_hash": good.settings_fingerprint() }),
    );
    finish(
        &ex.output_root,
        tampered.request_id(),
        serde_json::json!({ "status": "completed", "result": 0.1, "dft_settings_hash": tampered.settings_fingerprint() }),
    );
    std::fs::write(
        ex.input_root
            .join(tampered.request_id().as_str())
            .join(SETTINGS_JSON),
        r#"{"code":"VASP","encut":400,"kpoints":[4,4,4]}"#,
    )
    .unwrap();

    let summary = validate_handoff(&ex.input_root, &ex.output_root).unwrap();
    assert_eq!(summary.total_packages, 3);
    assert_eq!(summary.input_valid, 2);
    assert_eq!(summary.output_valid, 2);
    assert!(!summary.all_valid());

    let by_id = |rid: &RequestId| {
        summary
            .reports
            .iter()
            .find(|r| r.request_id == rid.as_str())
            .unwrap()
    };
    let good_report = by_id(good.request_id());
    assert!(good_report.input_valid && good_report.output_valid);
    assert!(good_report.issues.is_empty());
    assert_eq!(good_report.package_digest.as_ref().map(String::len), Some(64));

    let missing_report = by_id(missing.request_id());
    assert!(missing_report.input_valid);
    assert!(!missing_report.output_valid);
    assert_eq!(missing_report.issues, vec!["Missing output file: results.json"]);

    let tampered_report = by_id(tampered.request_id());
    assert!(!tampered_report.input_valid);
    assert!(tampered_report
        .issues
        .iter()
        .any(|i| i.contains("does not match package contents")));

    let report_path = ex.output_root.join("qa").join("handoff_validation.json");
    write_validation_report(&report_path, &summary).unwrap();
    let written: qal_handoff::HandoffValidationSummary =
        serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
    assert_eq!(written, summary);
}

#[test]
fn validator_flags_missing_metadata_fields() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in").join("req-1");
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join(METADATA_JSON), r#"{"request_id":"req-1"}"#).unwrap();
    std::fs::write(input.join(DESCRIPTOR_JSON), "[1.0]").unwrap();
    std::fs::write(input.join(SETTINGS_JSON), "{}").unwrap();

    let summary = validate_handoff(&dir.path().join("in"), &dir.path().join("out")).unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.request_id, "req-1");
    assert!(!report.input_valid);
    for field in ["source_dataset", "timestamp_utc", "composition"] {
        assert!(report
            .issues
            .contains(&format!("Metadata missing field: {}", field)));
    }
}

#[test]
fn validator_needs_an_input_root() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        validate_handoff(&dir.path().join("absent"), dir.path()),
        Err(HandoffError::RootNotFound(_))
    ));
}
