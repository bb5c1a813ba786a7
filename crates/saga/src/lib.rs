//! Saga orchestration over unreliable services.
//!
//! A [`SagaDefinition`] lists ordered steps, each with a forward operation
//! and an optional compensating one. The [`SagaOrchestrator`] runs an
//! instance step by step, persisting every transition through a
//! compare-and-swap store so any replica can resume it. When a step fails
//! for good, the steps that already succeeded are compensated in reverse
//! order.
//!
//! Every outbound call goes through the resilience layer: a bulkhead pool
//! per destination, a shared circuit breaker per (source, destination)
//! pair, and a deadline derived from the saga's remaining budget.

pub mod definition;
pub mod error;
pub mod instance;
pub mod invoker;
pub mod orchestrator;
pub mod repository;
pub mod state;
pub mod worker;

pub use definition::{DefinitionRegistry, OperationRef, SagaDefinition, SagaStep};
pub use error::{ErrorKind, FailureCode, Result, SagaError, StepError, StepFailure};
pub use instance::{FailureRecord, SagaInstance, SagaStatus, StepOutcomes, StepRecord};
pub use invoker::{Behavior, Invocation, ScriptedInvoker, StepInvoker};
pub use orchestrator::{CancelAck, OrchestratorConfig, SagaOrchestrator};
pub use repository::SagaRepository;
pub use state::{SagaState, StepOutcome};
pub use worker::{ShardAssignment, SweepReport, WorkerConfig, WorkerPool};
