//! QAL Core Library
//!
//! Closed-loop active learning: a pool of candidates, a surrogate retrained
//! every round, pluggable acquisition strategies, and an oracle gateway that
//! tracks asynchronous evaluations with fingerprint-verified results.

pub mod acquisition;
pub mod config;
pub mod constraints;
pub mod controller;
pub mod dataset;
pub mod domain;
pub mod gateway;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod reporting;
pub mod session;
pub mod simulated;
pub mod surrogate;
pub mod telemetry;

pub use acquisition::{
    expected_improvement, select_batch, strategy_for, AcquisitionScore, AcquisitionStrategy,
    Objective, ScoringContext, StrategyKind,
};
pub use config::{OracleKind, QalConfig, RunContext, EXAMPLE_CONFIG};
pub use constraints::{parse_formula, CandidateFilter, CompositionRules};
pub use controller::{LoopController, LoopState, RunAborted, RunOutcome};
pub use dataset::{Dataset, Split};
pub use domain::{
    AcquisitionError, Candidate, CandidateId, ConfigError, DataError, ErrorClass,
    FailureReason, IterationRecord, LabeledExample, OracleError, OraclePayload, OracleRequest,
    Origin, PoolError, QalError, RequestId, RequestStatus, Result, RunSummary, SurrogateError,
    TerminationReason,
};
pub use gateway::{BackendReport, BatchOutcome, OracleBackend, OracleGateway, Submission};
pub use metrics::{label_efficiency_gain, MetricsRecorder};
pub use pool::{Exclusion, ExclusionReason, PoolStore};
pub use reporting::{write_aborted_report, write_run_report, AbortedReport, RunReport};
pub use session::{build_controller, prepare_run, PreparedRun};
pub use simulated::SimulatedOracle;
pub use surrogate::{GaussianProcess, Prediction, SurrogateModel};

/// QAL version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
