//! Engine error types.
//!
//! Errors fall into three families:
//! - **Rejections**: [`PregelError::BadParameter`] is returned synchronously
//!   from [`Conductor::start_execution`](crate::conductor::Conductor::start_execution)
//!   and the run never starts.
//! - **Protocol violations**: [`PregelError::MessageStepMismatch`],
//!   [`PregelError::MessageMalformed`] and
//!   [`PregelError::MessageServerNameMismatch`] are raised to the caller of
//!   [`Conductor::finished_step`](crate::conductor::Conductor::finished_step)
//!   and leave the execution untouched.
//! - **Execution failures**: [`PregelError::AlgorithmRuntime`],
//!   [`PregelError::Timeout`] and [`PregelError::Internal`] are terminal for a
//!   run. They travel between servers as a [`ReportedError`] and are retained on
//!   the execution (first one wins).
//!
//! Infrastructure seams (queues, stores, transports) use [`anyhow::Result`];
//! only the protocol surface speaks [`PregelError`].
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ExecutionId;

pub type Result<T> = std::result::Result<T, PregelError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PregelError {
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("step mismatch: execution is at step {expected}, report was for step {actual}")]
    MessageStepMismatch { expected: u64, actual: u64 },
    #[error("malformed message: {0}")]
    MessageMalformed(String),
    #[error("server `{0}` is not expected to report for this step")]
    MessageServerNameMismatch(String),
    #[error("algorithm error: {0}")]
    AlgorithmRuntime(String),
    #[error("step {step} did not complete in time")]
    Timeout { step: u64 },
    #[error("no target vertex provided")]
    NoTargetProvided,
    #[error("invalid target vertex `{0}`")]
    InvalidTargetVertex(String),
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable classification of a [`PregelError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadParameter,
    MessageStepMismatch,
    MessageMalformed,
    MessageServerNameMismatch,
    AlgorithmRuntime,
    Timeout,
    NoTargetProvided,
    InvalidTargetVertex,
    ExecutionNotFound,
    Internal,
}

impl ErrorKind {
    /// Numeric error code exposed to clients.
    pub fn code(&self) -> u32 {
        match self {
            Self::BadParameter => 1600,
            Self::MessageStepMismatch => 1601,
            Self::MessageMalformed => 1602,
            Self::MessageServerNameMismatch => 1603,
            Self::AlgorithmRuntime => 1604,
            Self::Timeout => 1605,
            Self::NoTargetProvided => 1606,
            Self::InvalidTargetVertex => 1607,
            Self::ExecutionNotFound => 1608,
            Self::Internal => 1699,
        }
    }
}

impl PregelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadParameter(_) => ErrorKind::BadParameter,
            Self::MessageStepMismatch { .. } => ErrorKind::MessageStepMismatch,
            Self::MessageMalformed(_) => ErrorKind::MessageMalformed,
            Self::MessageServerNameMismatch(_) => ErrorKind::MessageServerNameMismatch,
            Self::AlgorithmRuntime(_) => ErrorKind::AlgorithmRuntime,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NoTargetProvided => ErrorKind::NoTargetProvided,
            Self::InvalidTargetVertex(_) => ErrorKind::InvalidTargetVertex,
            Self::ExecutionNotFound(_) => ErrorKind::ExecutionNotFound,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// Wrap an error raised by user algorithm code.
    ///
    /// The full context chain is kept in the message so that errors such as
    /// [`PregelError::NoTargetProvided`] remain visible to the client.
    pub fn algorithm(err: anyhow::Error) -> Self {
        Self::AlgorithmRuntime(format!("{err:#}"))
    }

    /// Wrap an engine failure.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Convert the payload of a panic in user algorithm code.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::AlgorithmRuntime(format!("algorithm panicked: {message}"))
    }
}

/// The serializable form of an execution failure.
///
/// This is what workers put into their step reports and what
/// [`Conductor::get_result`](crate::conductor::Conductor::get_result) returns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
}

impl From<&PregelError> for ReportedError {
    fn from(err: &PregelError) -> Self {
        let kind = err.kind();
        Self {
            kind,
            code: kind.code(),
            message: err.to_string(),
        }
    }
}

impl From<PregelError> for ReportedError {
    fn from(err: PregelError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for ReportedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
