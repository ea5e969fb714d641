//! Error taxonomy surfaced to callers
//!
//! Per-attempt failures never leave the engine. Callers only see the
//! terminal outcome of an operation, or a [`ReconcileError::PartialFailure`]
//! that records which steps already committed.

use crate::diff::Partition;
use crate::identity::DecodeError;
use crate::remote::{OperationHandle, RemoteFailure, Scope};
use crate::retry::ErrorClass;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One step of a multi-step create or update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    /// Deriving the stored identity from the created object
    Identity,
    Apply(Partition),
    /// The read that follows all mutating calls
    Refresh,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Create => f.write_str("create"),
            Step::Identity => f.write_str("identity"),
            Step::Apply(partition) => write!(f, "{}", partition),
            Step::Refresh => f.write_str("refresh"),
        }
    }
}

fn join_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Flat projection of [`ReconcileError`] for callers that only branch on kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Conflict,
    NotFound,
    InvalidInput,
    Unknown,
    DeadlineExceeded,
    Cancelled,
    OperationFailed,
    PartialFailure,
    Decode,
    Client,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{op}: transient failure persisted after {attempts} attempt(s): {source}")]
    Transient {
        op: String,
        attempts: u32,
        #[source]
        source: RemoteFailure,
    },

    #[error("{op}: still throttled after {attempts} attempt(s): {source}")]
    RateLimited {
        op: String,
        attempts: u32,
        #[source]
        source: RemoteFailure,
    },

    #[error("{op}: remote object state forbids this operation ({attempts} attempt(s)): {source}")]
    Conflict {
        op: String,
        attempts: u32,
        #[source]
        source: RemoteFailure,
    },

    #[error("{op}: remote object not found")]
    NotFound { op: String },

    #[error("{op}: invalid input: {reason}")]
    InvalidInput { op: String, reason: String },

    #[error("{op}: unrecognized failure recurred after {attempts} attempt(s): {source}")]
    Unrecognized {
        op: String,
        attempts: u32,
        #[source]
        source: RemoteFailure,
    },

    #[error("{op}: deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        op: String,
        elapsed: Duration,
        last_failure: Option<RemoteFailure>,
    },

    #[error("{op}: cancelled")]
    Cancelled { op: String },

    #[error("{handle} failed: {reason}")]
    OperationFailed { handle: OperationHandle, reason: String },

    #[error("{handle} not finished after {elapsed:?}; it may still complete")]
    OperationTimedOut {
        handle: OperationHandle,
        elapsed: Duration,
    },

    #[error("{failed} failed after committing [{}]: {source}", join_steps(.committed))]
    PartialFailure {
        /// Identity of the object, when it exists remotely
        identity: Option<String>,
        committed: Vec<Step>,
        failed: Step,
        #[source]
        source: Box<ReconcileError>,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("identity component {component:?} contains the separator {separator:?}")]
    InvalidComponent { component: String, separator: char },

    #[error("failed to build client for scope {scope}: {source}")]
    Client {
        scope: Scope,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    /// Build the terminal error for a call whose retries stopped on `class`
    pub fn exhausted(op: &str, class: ErrorClass, attempts: u32, source: RemoteFailure) -> Self {
        let op = op.to_string();
        match class {
            ErrorClass::Transient => Self::Transient { op, attempts, source },
            ErrorClass::RateLimited => Self::RateLimited { op, attempts, source },
            ErrorClass::Conflict => Self::Conflict { op, attempts, source },
            ErrorClass::NotFound => Self::NotFound { op },
            ErrorClass::InvalidInput => Self::InvalidInput {
                op,
                reason: source.to_string(),
            },
            ErrorClass::Unknown => Self::Unrecognized { op, attempts, source },
        }
    }

    pub fn invalid_input(op: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    pub fn partial(
        identity: Option<String>,
        committed: Vec<Step>,
        failed: Step,
        source: Self,
    ) -> Self {
        Self::PartialFailure {
            identity,
            committed,
            failed,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput { .. } | Self::InvalidComponent { .. } => ErrorKind::InvalidInput,
            Self::Unrecognized { .. } => ErrorKind::Unknown,
            Self::DeadlineExceeded { .. } | Self::OperationTimedOut { .. } => {
                ErrorKind::DeadlineExceeded
            },
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::OperationFailed { .. } => ErrorKind::OperationFailed,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Client { .. } => ErrorKind::Client,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Steps that committed before the failure (empty unless partial)
    pub fn committed(&self) -> &[Step] {
        match self {
            Self::PartialFailure { committed, .. } => committed,
            _ => &[],
        }
    }

    /// The remote operation that was still running when waiting stopped
    pub fn pending_operation(&self) -> Option<&OperationHandle> {
        match self {
            Self::OperationTimedOut { handle, .. } => Some(handle),
            Self::PartialFailure { source, .. } => source.pending_operation(),
            _ => None,
        }
    }
}
