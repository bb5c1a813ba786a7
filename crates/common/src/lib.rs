//! Shared identifier types used across the orchestration crates.

mod types;

pub use types::{InstanceId, LeaseId, ServiceId, ServicePair, SpanId, TraceId};
