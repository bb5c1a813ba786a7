//! Resilience error types.

use std::time::Duration;

use common::ServicePair;
use state_store::StoreError;
use thiserror::Error;

/// Errors returned by the resource pool manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No slot became free within the allowed wait, or the wait queue was full.
    #[error("POOL_EXHAUSTED: pool {pair} has no free slot (waited {waited:?})")]
    Exhausted { pair: ServicePair, waited: Duration },
}

/// Errors returned by the circuit breaker manager.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The shared breaker record could not be read or written.
    #[error("Breaker store error: {0}")]
    Store(#[from] StoreError),

    /// Admission could not settle on a record version after repeated conflicts.
    #[error("Breaker record for {pair} kept changing after {attempts} attempts")]
    Contended { pair: ServicePair, attempts: u32 },
}

/// Errors returned by deadline propagation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeadlineError {
    /// Deriving a child context left no time to make the call.
    #[error("DEADLINE_ALREADY_EXCEEDED: deadline passed {overdue_ms}ms ago")]
    AlreadyExceeded { overdue_ms: i64 },

    /// The guarded call was still running when the deadline hit.
    #[error("DEADLINE_EXCEEDED: call did not finish within {budget:?}")]
    Exceeded { budget: Duration },

    /// A propagated header could not be decoded.
    #[error("Invalid correlation header '{header}': {reason}")]
    InvalidHeader { header: String, reason: String },
}
