//! QAL Handoff: file-based DFT oracle backend
//!
//! Exchanges JSON packages with an external DFT workflow through an input
//! and an output directory, and validates those packages after the fact.
//!
//! ## Key Components
//!
//! - `HandoffOracle`: `OracleBackend` that writes packages and reads results
//! - `validate_handoff`: per-package checks aggregated into a summary

mod error;
pub mod oracle;
pub mod package;
pub mod validate;

pub use error::{HandoffError, Result};
pub use oracle::HandoffOracle;
pub use package::{HandoffResults, PackageMetadata, ResultStatus};
pub use validate::{
    validate_handoff, validate_package, write_validation_report, HandoffValidationSummary,
    PackageReport,
};
