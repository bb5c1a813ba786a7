//! Failure-containment primitives for cross-service calls.
//!
//! - [`pool`]: per-(source, destination) bulkheads bounding in-flight calls
//! - [`breaker`]: circuit breakers whose state is shared through a versioned store
//! - [`context`]: deadline and correlation propagation along a call chain
//! - [`retry`]: bounded exponential backoff
//! - [`telemetry`]: fire-and-forget event sink

pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod retry;
pub mod telemetry;

pub use breaker::{
    Admission, BreakerState, CallOutcome, CircuitBreakerManager, CircuitBreakerRecord, Priority,
    RejectReason,
};
pub use config::{PoolLimits, ResilienceConfig};
pub use context::{CorrelationContext, derive, remaining, within};
pub use error::{BreakerError, DeadlineError, PoolError};
pub use pool::{Lease, PoolStats, ResourcePoolManager};
pub use retry::RetryPolicy;
pub use telemetry::{
    ChannelSink, InMemorySink, NoopSink, TelemetryEvent, TelemetrySink, TracingSink,
};
