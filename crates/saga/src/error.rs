//! Saga error types and failure classification.

use common::InstanceId;
use resilience::BreakerError;
use serde::{Deserialize, Serialize};
use state_store::StoreError;
use thiserror::Error;

/// Failure class of a step error, deciding retry and breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network blip, pool exhaustion, open circuit. Retried with backoff.
    Transient,
    /// Invalid input or business-rule rejection. Never retried.
    Permanent,
    /// Retried like `Transient` and counted as a breaker failure.
    DeadlineExceeded,
    /// A compensation gave up. Requires an operator.
    CompensationFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::CompensationFailure => "COMPENSATION_FAILURE",
        })
    }
}

/// Machine-readable reason a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    CircuitOpen,
    PoolExhausted,
    DeadlineAlreadyExceeded,
    DeadlineExceeded,
    Transient,
    Permanent,
    Cancelled,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::CircuitOpen => "CIRCUIT_OPEN",
            FailureCode::PoolExhausted => "POOL_EXHAUSTED",
            FailureCode::DeadlineAlreadyExceeded => "DEADLINE_ALREADY_EXCEEDED",
            FailureCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            FailureCode::Transient => "TRANSIENT",
            FailureCode::Permanent => "PERMANENT",
            FailureCode::Cancelled => "CANCELLED",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureCode::CircuitOpen | FailureCode::PoolExhausted | FailureCode::Transient => {
                ErrorKind::Transient
            }
            FailureCode::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            // No time is left, so retrying cannot help.
            FailureCode::DeadlineAlreadyExceeded
            | FailureCode::Permanent
            | FailureCode::Cancelled => ErrorKind::Permanent,
        }
    }

    /// Returns true if the step may be attempted again within its retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::DeadlineExceeded
        )
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a step invoker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    /// The failure code recorded for this error.
    pub fn code(&self) -> FailureCode {
        match self.kind {
            ErrorKind::Transient => FailureCode::Transient,
            ErrorKind::DeadlineExceeded => FailureCode::DeadlineExceeded,
            ErrorKind::Permanent | ErrorKind::CompensationFailure => FailureCode::Permanent,
        }
    }
}

/// Outcome of a failed call attempt, as recorded on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub code: FailureCode,
    pub message: String,
}

impl StepFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<StepError> for StepFailure {
    fn from(err: StepError) -> Self {
        Self::new(err.code(), err.message)
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("DEFINITION_NOT_FOUND: no saga definition registered as '{0}'")]
    DefinitionNotFound(String),

    #[error("INSTANCE_NOT_FOUND: no saga instance {0}")]
    InstanceNotFound(InstanceId),

    /// The definition failed validation at registration.
    #[error("Invalid saga definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    /// Definitions are immutable once registered.
    #[error("Saga definition '{0}' is already registered")]
    DefinitionAlreadyRegistered(String),

    /// The requested transition would break an instance invariant.
    #[error("Invalid transition for saga {instance_id} in state {state}: {reason}")]
    InvalidTransition {
        instance_id: InstanceId,
        state: String,
        reason: String,
    },

    /// Another writer changed the instance since it was read.
    #[error("Saga {instance_id} was modified concurrently")]
    ConcurrentModification { instance_id: InstanceId },

    /// Execution kept losing version races.
    #[error("Saga {instance_id} gave up after {attempts} version conflicts")]
    ConflictRetriesExhausted {
        instance_id: InstanceId,
        attempts: u32,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Stable code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::DefinitionNotFound(_) => "DEFINITION_NOT_FOUND",
            SagaError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            SagaError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            SagaError::DefinitionAlreadyRegistered(_) => "DEFINITION_ALREADY_REGISTERED",
            SagaError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SagaError::ConcurrentModification { .. }
            | SagaError::ConflictRetriesExhausted { .. } => "CONCURRENT_MODIFICATION",
            SagaError::Store(_) | SagaError::Breaker(_) | SagaError::Serialization(_) => {
                "INTERNAL"
            }
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
