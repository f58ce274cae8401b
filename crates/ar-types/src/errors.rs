use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the AutoRAG optimizer
#[derive(Error, Debug)]
pub enum ArError {
    #[error("Invalid config space: {0}")]
    InvalidConfigSpace(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single trial evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("evaluation timed out after {timeout_secs:.1} seconds")]
    Timeout { timeout_secs: f64 },

    #[error("rate limited by upstream service: {message}")]
    RateLimited { message: String },

    #[error("upstream service failure: {message}")]
    UpstreamFailure { message: String },

    #[error("pipeline construction failed: {message}")]
    PipelineConstruction { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("unknown evaluation failure: {message}")]
    Unknown { message: String },
}

impl EvaluationError {
    /// Transient failures are worth retrying; everything else fails the trial
    /// on the first attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::UpstreamFailure { .. }
        )
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout { .. } => FailureReason::Timeout,
            Self::RateLimited { .. } => FailureReason::RateLimited,
            Self::UpstreamFailure { .. } => FailureReason::UpstreamFailure,
            Self::PipelineConstruction { .. } => FailureReason::PipelineConstruction,
            Self::InvalidConfiguration { .. } => FailureReason::InvalidConfiguration,
            Self::Unknown { .. } => FailureReason::Unknown,
        }
    }
}

/// Serializable classification of an [`EvaluationError`], recorded on failed
/// trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    RateLimited,
    UpstreamFailure,
    PipelineConstruction,
    InvalidConfiguration,
    Unknown,
}

/// Run-level errors raised by the orchestrator.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("too many failed trials: {failed} failures exceed {max_failure_ratio} of budget {budget}")]
    TooManyFailures {
        failed: usize,
        budget: usize,
        max_failure_ratio: f64,
    },

    #[error("evaluation set is empty")]
    EmptyEvaluationSet,

    #[error("run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("run {run_id} already finished with status {status}")]
    AlreadyFinished { run_id: String, status: String },

    #[error("invalid trial transition for trial {trial_id}: {from} -> {to}")]
    InvalidTransition {
        trial_id: String,
        from: String,
        to: String,
    },
}

/// Durable-state failures. Always fatal to a run.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to write run journal {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("failed to read run journal {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("corrupt run journal {path} at line {line}: {message}")]
    Corrupt {
        path: String,
        line: usize,
        message: String,
    },

    #[error("run journal {path} has no header record")]
    MissingHeader { path: String },
}

/// Result type alias for AutoRAG operations
pub type ArResult<T> = Result<T, ArError>;

/// Macro for creating config space errors
#[macro_export]
macro_rules! space_error {
    ($($arg:tt)*) => {
        $crate::ArError::InvalidConfigSpace(format!($($arg)*))
    };
}

/// Macro for creating invalid configuration errors
#[macro_export]
macro_rules! configuration_error {
    ($($arg:tt)*) => {
        $crate::ArError::InvalidConfiguration(format!($($arg)*))
    };
}

/// Macro for creating settings errors
#[macro_export]
macro_rules! settings_error {
    ($($arg:tt)*) => {
        $crate::ArError::Settings(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::ArError::Internal(format!($($arg)*))
    };
}
