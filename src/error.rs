use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::state_machine::{Event, JobStatus};

/// Failures of the artifact store. Every one of them aborts a run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    Duplicate(String),

    #[error("invalid job id: {0:?}")]
    InvalidId(String),

    #[error("sub-unit {ordinal} not found in job {job_id}")]
    UnitNotFound { job_id: String, ordinal: u32 },

    #[error("could not lock job {0} for update")]
    Locked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of a single oracle call. The quality gate consumes these as a
/// failed attempt, except [`OracleError::Store`], which aborts the run.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(#[from] AnthropicError),

    #[error("oracle returned no text")]
    Empty,

    #[error("could not record oracle usage: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("job {0} lost its run lease to another runner")]
    LeaseLost(String),

    #[error("cannot apply {event} to a job that is {from}")]
    InvalidTransition { from: JobStatus, event: Event },

    #[error("job {id} is {status}; {action} is not allowed")]
    InvalidState {
        id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),
}

/// Classifies why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// A quality gate used up its retry budget.
    GateExhausted,
    /// The accepted outline contained no recognisable sub-unit headers.
    EmptyDecomposition,
    /// Persistence failed mid-run.
    Store,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::GateExhausted => write!(f, "retry budget exhausted"),
            FailureKind::EmptyDecomposition => write!(f, "empty decomposition"),
            FailureKind::Store => write!(f, "store failure"),
        }
    }
}
