//! Error types for qal-handoff

use qal_core::domain::OracleError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or writing handoff packages
#[derive(Error, Debug)]
pub enum HandoffError {
    /// Filesystem access failed
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A package file is not valid JSON of the expected shape
    #[error("malformed {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Package contents could not be fingerprinted
    #[error("fingerprint failed: {0}")]
    Fingerprint(String),

    /// The handoff root to scan does not exist
    #[error("handoff root not found: {0}")]
    RootNotFound(PathBuf),

    /// The request id would resolve outside its handoff root
    #[error("request id {0:?} is not a plain directory name")]
    UnsafeRequestId(String),
}

impl HandoffError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<HandoffError> for OracleError {
    fn from(err: HandoffError) -> Self {
        match err {
            HandoffError::Io { path, source } => OracleError::io(path.display().to_string(), source),
            HandoffError::Fingerprint(message) => OracleError::Fingerprint(message),
            unsafe_id @ HandoffError::UnsafeRequestId(_) => {
                OracleError::InvalidRequest(unsafe_id.to_string())
            }
            // A half-written results file is retried on the next poll.
            other => OracleError::Backend(other.to_string()),
        }
    }
}

/// Result type for handoff operations
pub type Result<T> = std::result::Result<T, HandoffError>;
