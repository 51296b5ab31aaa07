//! Domain-level error taxonomy for QAL.

use crate::domain::candidate::CandidateId;
use crate::domain::oracle::{RequestId, RequestStatus};
use std::path::PathBuf;

/// Errors raised by the pool store.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("candidate not found in unlabeled pool: {0}")]
    NotFound(CandidateId),

    #[error("candidate already labeled: {0}")]
    AlreadyLabeled(CandidateId),

    #[error("seed ids and labels differ in length: {ids} ids, {labels} labels")]
    SeedLengthMismatch { ids: usize, labels: usize },
}

/// Errors raised by a surrogate model.
#[derive(Debug, thiserror::Error)]
pub enum SurrogateError {
    #[error("insufficient training data: got {got} examples, need at least {min}")]
    InsufficientData { got: usize, min: usize },

    #[error("surrogate model queried before fit")]
    NotFitted,

    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("numerical failure: {0}")]
    Numerical(String),
}

/// Errors raised by acquisition strategies.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("insufficient pool: requested batch of {requested}, only {available} candidates available")]
    InsufficientPool { requested: usize, available: usize },
}

/// Errors raised by the oracle gateway and its backends.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle backend error: {0}")]
    Backend(String),

    #[error("unknown oracle request: {0}")]
    UnknownRequest(RequestId),

    /// The backend can never serve this request; retrying will not help.
    #[error("invalid oracle request: {0}")]
    InvalidRequest(String),

    #[error("invalid request status transition: {current} -> {requested}")]
    InvalidTransition {
        current: RequestStatus,
        requested: RequestStatus,
    },

    #[error("fingerprint error: {0}")]
    Fingerprint(String),

    #[error("io error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OracleError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while ingesting candidate tables.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("malformed candidate {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("insufficient labeled rows: need {needed} for evaluation and seed sets, found {found}")]
    InsufficientLabeled { needed: usize, found: usize },
}

/// Coarse error classes used by the loop controller to decide what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the run immediately.
    FatalConfig,
    /// Retried automatically on the next round.
    TransientOracle,
    /// The result is discarded and the candidate is cooled down.
    IntegrityMismatch,
    /// The offending candidate is excluded; the run continues.
    Data,
}

/// Top-level QAL error.
#[derive(Debug, thiserror::Error)]
pub enum QalError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("digest error: {0}")]
    Digest(String),

    #[error("invalid loop transition: {current} -> {requested}")]
    InvalidPhaseTransition { current: String, requested: String },

    #[error("iteration record out of order: expected {expected}, got {actual}")]
    RecordOutOfOrder { expected: u64, actual: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QalError {
    /// Map this error onto the controller's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            QalError::Oracle(OracleError::Backend(_)) => ErrorClass::TransientOracle,
            QalError::Data(DataError::Malformed { .. }) => ErrorClass::Data,
            QalError::Surrogate(SurrogateError::DimensionMismatch { .. }) => ErrorClass::Data,
            _ => ErrorClass::FatalConfig,
        }
    }
}

/// Result type for QAL domain operations.
pub type Result<T> = std::result::Result<T, QalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::NotFound(CandidateId::new("mp-149"));
        assert!(err.to_string().contains("mp-149"));

        let err = PoolError::AlreadyLabeled(CandidateId::new("mp-13"));
        assert!(err.to_string().contains("already labeled"));
    }

    #[test]
    fn test_insufficient_pool_message() {
        let err = AcquisitionError::InsufficientPool {
            requested: 25,
            available: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("25"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_error_classes() {
        let fatal: QalError = SurrogateError::InsufficientData { got: 2, min: 5 }.into();
        assert_eq!(fatal.class(), ErrorClass::FatalConfig);

        let transient: QalError = OracleError::Backend("connection reset".to_string()).into();
        assert_eq!(transient.class(), ErrorClass::TransientOracle);

        let data: QalError = DataError::Malformed {
            id: "x".to_string(),
            reason: "NaN feature".to_string(),
        }
        .into();
        assert_eq!(data.class(), ErrorClass::Data);
    }
}
