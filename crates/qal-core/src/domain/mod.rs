//! Domain models for QAL.
//!
//! Canonical definitions for the core entities:
//! - `Candidate` / `LabeledExample`: pool members and their labels
//! - `OracleRequest`: a tracked evaluation request
//! - `IterationRecord` / `RunSummary`: run metrics

pub mod candidate;
pub mod error;
pub mod fingerprint;
pub mod oracle;
pub mod record;

pub use candidate::{Candidate, CandidateId, LabeledExample, Origin};
pub use error::{
    AcquisitionError, ConfigError, DataError, ErrorClass, OracleError, PoolError, QalError, Result,
    SurrogateError,
};
pub use oracle::{FailureReason, OraclePayload, OracleRequest, RequestId, RequestStatus};
pub use record::{IterationRecord, RunSummary, TerminationReason};
