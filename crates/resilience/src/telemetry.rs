//! Fire-and-forget telemetry for orchestration decisions.
//!
//! `emit` is synchronous and never waits: a sink that cannot accept an event
//! drops it. Orchestration must not stall on observability.

use std::sync::{Arc, Mutex, PoisonError};

use common::{InstanceId, ServicePair};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::breaker::{BreakerState, Priority};

/// A state transition or decision worth recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    AdmitDecision {
        pair: ServicePair,
        priority: Priority,
        state: BreakerState,
        admitted: bool,
        reason: Option<String>,
    },
    BreakerTransition {
        pair: ServicePair,
        from: BreakerState,
        to: BreakerState,
    },
    /// A CRITICAL call was forced through a breaker that would have rejected it.
    CriticalOverride {
        pair: ServicePair,
        state: BreakerState,
    },
    /// An outcome report was dropped after exhausting its CAS retries.
    ReportDropped { pair: ServicePair, attempts: u32 },
    PoolRejected { pair: ServicePair },
    SagaTransition {
        instance_id: InstanceId,
        from: String,
        to: String,
    },
    StepOutcome {
        instance_id: InstanceId,
        step: String,
        outcome: String,
        code: Option<String>,
    },
    CompensationOutcome {
        instance_id: InstanceId,
        step: String,
        succeeded: bool,
        attempts: u32,
    },
    /// Compensation gave up; an operator must intervene.
    Escalation {
        instance_id: InstanceId,
        step: String,
        reason: String,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::AdmitDecision { .. } => "admit_decision",
            TelemetryEvent::BreakerTransition { .. } => "breaker_transition",
            TelemetryEvent::CriticalOverride { .. } => "critical_override",
            TelemetryEvent::ReportDropped { .. } => "report_dropped",
            TelemetryEvent::PoolRejected { .. } => "pool_rejected",
            TelemetryEvent::SagaTransition { .. } => "saga_transition",
            TelemetryEvent::StepOutcome { .. } => "step_outcome",
            TelemetryEvent::CompensationOutcome { .. } => "compensation_outcome",
            TelemetryEvent::Escalation { .. } => "escalation",
        }
    }
}

/// Destination for telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Arc<T> {
    fn emit(&self, event: TelemetryEvent) {
        (**self).emit(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Writes every event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::Escalation {
                instance_id,
                step,
                reason,
            } => {
                tracing::error!(%instance_id, step, reason, "saga escalated for manual intervention");
            }
            TelemetryEvent::CriticalOverride { pair, state } => {
                tracing::warn!(target: "audit", %pair, %state, "critical call forced through breaker");
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                tracing::info!(kind = other.kind(), %payload, "telemetry");
            }
        }
    }
}

/// Forwards events to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("telemetry_events_dropped_total").increment(1);
            tracing::debug!(error = %e, "telemetry event dropped");
        }
    }
}

/// Records events in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event recorded so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded events of one kind.
    pub fn events_of_kind(&self, kind: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }
}

impl TelemetrySink for InMemorySink {
    fn emit(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
