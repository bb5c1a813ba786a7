//! Saga orchestrator: drives instances through their steps and compensations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{InstanceId, ServiceId, ServicePair};
use resilience::{
    Admission, CallOutcome, CircuitBreakerManager, CorrelationContext, DeadlineError,
    ResilienceConfig, ResourcePoolManager, RetryPolicy, TelemetryEvent, TelemetrySink, derive,
    within,
};
use serde_json::{Value, json};
use state_store::VersionedStore;

use crate::definition::{DefinitionRegistry, OperationRef, SagaDefinition, SagaStep};
use crate::error::{ErrorKind, FailureCode, Result, SagaError, StepFailure};
use crate::instance::{SagaInstance, SagaStatus};
use crate::invoker::StepInvoker;
use crate::repository::SagaRepository;
use crate::state::SagaState;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Caller identity used for breaker and pool keys.
    pub source_id: ServiceId,
    /// Budget of the whole forward path, from `start_saga`.
    pub saga_timeout: Duration,
    /// Upper bound on waiting for a pool slot, further capped by the call deadline.
    pub pool_max_wait: Duration,
    pub step_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
    /// Version conflicts tolerated by one `run` before giving up.
    pub max_conflict_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_id: ServiceId::new("saga-orchestrator"),
            saga_timeout: Duration::from_secs(300),
            pool_max_wait: Duration::from_secs(5),
            step_retry: RetryPolicy::for_step(),
            compensation_retry: RetryPolicy::for_compensation(),
            max_conflict_retries: 3,
        }
    }
}

/// Result of `cancel_saga`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The request was recorded and is observed at the next step boundary.
    Requested,
    /// The instance had already finished. Nothing to do.
    AlreadyTerminal,
}

/// Removes an instance from the in-process running set on drop.
struct Claim<'a> {
    running: &'a Mutex<HashSet<InstanceId>>,
    id: InstanceId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Executes saga instances against external services.
///
/// Each forward call goes through breaker admission, a bulkhead lease and a
/// derived deadline; its outcome feeds back into the breaker. Every state
/// change is persisted with a version check before the next one is attempted,
/// so a crashed run can be resumed by any replica from the stored state.
pub struct SagaOrchestrator<S, I> {
    registry: Arc<DefinitionRegistry>,
    repository: SagaRepository<S>,
    breakers: CircuitBreakerManager<S>,
    pools: ResourcePoolManager,
    invoker: I,
    telemetry: Arc<dyn TelemetrySink>,
    config: OrchestratorConfig,
    running: Mutex<HashSet<InstanceId>>,
}

impl<S, I> SagaOrchestrator<S, I>
where
    S: VersionedStore + Clone,
    I: StepInvoker,
{
    pub fn new(
        store: S,
        registry: Arc<DefinitionRegistry>,
        invoker: I,
        resilience: ResilienceConfig,
        config: OrchestratorConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            registry,
            repository: SagaRepository::new(store.clone()),
            breakers: CircuitBreakerManager::new(store, resilience.clone(), telemetry.clone()),
            pools: ResourcePoolManager::new(resilience),
            invoker,
            telemetry,
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &SagaRepository<S> {
        &self.repository
    }

    pub fn breakers(&self) -> &CircuitBreakerManager<S> {
        &self.breakers
    }

    pub fn pools(&self) -> &ResourcePoolManager {
        &self.pools
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Persists a new instance of a registered definition.
    #[tracing::instrument(skip(self, input))]
    pub async fn start_saga(&self, definition_id: &str, input: Value) -> Result<InstanceId> {
        let definition = self
            .registry
            .get(definition_id)
            .ok_or_else(|| SagaError::DefinitionNotFound(definition_id.to_string()))?;

        let mut instance = SagaInstance::new(&definition, input, self.config.saga_timeout);
        self.repository.save(&mut instance).await?;

        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(
            instance_id = %instance.id(),
            trace_id = %instance.trace_id(),
            steps = definition.len(),
            "saga started"
        );
        Ok(instance.id())
    }

    /// Starts an instance and runs it to a terminal state.
    pub async fn execute(&self, definition_id: &str, input: Value) -> Result<SagaStatus> {
        let id = self.start_saga(definition_id, input).await?;
        self.run(id).await
    }

    /// Returns the last persisted status of an instance.
    pub async fn get_saga_status(&self, id: InstanceId) -> Result<SagaStatus> {
        Ok(self.load(id).await?.status())
    }

    /// Requests cancellation. Idempotent; a no-op for finished instances.
    #[tracing::instrument(skip(self), fields(instance_id = %id))]
    pub async fn cancel_saga(&self, id: InstanceId) -> Result<CancelAck> {
        let instance = self.load(id).await?;
        if instance.state().is_terminal() {
            tracing::debug!(state = %instance.state(), "cancel ignored, saga already finished");
            return Ok(CancelAck::AlreadyTerminal);
        }
        self.repository.request_cancel(id).await?;
        tracing::info!(state = %instance.state(), "saga cancellation requested");
        Ok(CancelAck::Requested)
    }

    /// Drives an instance until it reaches a terminal state.
    ///
    /// Returns immediately with the current status if this process is already
    /// running the instance. Version conflicts abort the current transition and
    /// re-read, up to `max_conflict_retries` times.
    #[tracing::instrument(skip(self), fields(instance_id = %id))]
    pub async fn run(&self, id: InstanceId) -> Result<SagaStatus> {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!("saga already running in this process");
            return self.get_saga_status(id).await;
        };

        let mut conflicts = 0;
        loop {
            match self.advance(id).await {
                Ok(state) if state.is_terminal() => break,
                Ok(_) => {}
                Err(SagaError::ConcurrentModification { .. })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    tracing::warn!(conflicts, "saga modified concurrently, re-reading");
                }
                Err(SagaError::ConcurrentModification { .. }) => {
                    return Err(SagaError::ConflictRetriesExhausted {
                        instance_id: id,
                        attempts: conflicts,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.get_saga_status(id).await
    }

    /// Performs exactly one persisted transition of an instance.
    ///
    /// One forward step, one compensation, or one state change. Returns the
    /// resulting state; terminal instances are returned unchanged.
    pub async fn advance(&self, id: InstanceId) -> Result<SagaState> {
        let mut instance = self.load(id).await?;
        let definition = self
            .registry
            .get(instance.definition_id())
            .ok_or_else(|| SagaError::DefinitionNotFound(instance.definition_id().to_string()))?;
        let from = instance.state();

        match from {
            state if state.is_terminal() => return Ok(state),
            SagaState::Compensating => return self.compensate_next(&definition, instance).await,
            SagaState::StepFailed(_) => {
                instance.begin_compensation()?;
                self.persist(&mut instance, from).await?;
                return Ok(instance.state());
            }
            _ => {}
        }

        let index = instance.resume_point();
        let Some(step) = definition.get(index) else {
            instance.complete()?;
            self.persist(&mut instance, from).await?;
            return Ok(instance.state());
        };

        if self.repository.is_cancel_requested(id).await? {
            instance.cancel()?;
            self.persist(&mut instance, from).await?;
            metrics::counter!("saga_cancelled_total").increment(1);
            return Ok(instance.state());
        }

        instance.begin_step(index)?;
        self.persist(&mut instance, from).await?;

        let payload = json!({ "input": instance.input(), "results": instance.results() });
        let root = self.root_context(&instance);
        let started = Instant::now();
        let (result, attempts) = self.run_forward(step, &root, &payload).await?;
        metrics::histogram!("saga_step_duration_seconds", "step" => step.name.clone())
            .record(started.elapsed().as_secs_f64());

        let from = instance.state();
        let code = match result {
            Ok(output) => {
                instance.succeed_step(index, output, attempts)?;
                None
            }
            Err(failure) => {
                tracing::warn!(
                    step = %step.name,
                    code = %failure.code,
                    attempts,
                    reason = %failure.message,
                    "saga step failed"
                );
                let code = failure.code;
                instance.fail_step(index, failure, attempts)?;
                Some(code.as_str().to_string())
            }
        };
        self.persist(&mut instance, from).await?;

        self.telemetry.emit(TelemetryEvent::StepOutcome {
            instance_id: id,
            step: step.name.clone(),
            outcome: instance.steps()[index].outcome.to_string(),
            code,
        });
        Ok(instance.state())
    }

    async fn load(&self, id: InstanceId) -> Result<SagaInstance> {
        self.repository
            .load(id)
            .await?
            .ok_or(SagaError::InstanceNotFound(id))
    }

    fn claim(&self, id: InstanceId) -> Option<Claim<'_>> {
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then_some(Claim {
            running: &self.running,
            id,
        })
    }

    /// Saves and records the transition from `from`.
    async fn persist(&self, instance: &mut SagaInstance, from: SagaState) -> Result<()> {
        self.repository.save(instance).await?;

        let to = instance.state();
        if from == to {
            return Ok(());
        }
        tracing::info!(instance_id = %instance.id(), %from, %to, "saga transition");
        self.telemetry.emit(TelemetryEvent::SagaTransition {
            instance_id: instance.id(),
            from: from.to_string(),
            to: to.to_string(),
        });

        if to.is_terminal() {
            let elapsed = (Utc::now() - instance.created_at())
                .to_std()
                .unwrap_or_default();
            metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
            match to {
                SagaState::Completed => {
                    metrics::counter!("saga_completed_total").increment(1);
                    tracing::info!(instance_id = %instance.id(), ?elapsed, "saga completed");
                }
                SagaState::Compensated => {
                    metrics::counter!("saga_compensated_total").increment(1);
                    tracing::warn!(
                        instance_id = %instance.id(),
                        reason = instance.failure().map(|f| f.code.as_str()).unwrap_or("unknown"),
                        "saga compensated"
                    );
                }
                _ => metrics::counter!("saga_compensation_failed_total").increment(1),
            }
        }
        Ok(())
    }

    fn root_context(&self, instance: &SagaInstance) -> CorrelationContext {
        CorrelationContext::with_deadline(instance.trace_id(), instance.deadline())
            .with_baggage("saga.instance_id", instance.id().to_string())
            .with_baggage("saga.definition_id", instance.definition_id())
    }

    /// Runs a forward step, retrying retryable failures per `step_retry`.
    async fn run_forward(
        &self,
        step: &SagaStep,
        root: &CorrelationContext,
        payload: &Value,
    ) -> Result<(std::result::Result<Value, StepFailure>, u32)> {
        let policy = &self.config.step_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_forward(step, root, payload).await? {
                Ok(output) => return Ok((Ok(output), attempt)),
                Err(failure) if failure.code.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    metrics::counter!("saga_step_retries_total").increment(1);
                    tracing::debug!(step = %step.name, attempt, code = %failure.code, ?delay, "retrying step");
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Ok((Err(failure), attempt)),
            }
        }
    }

    async fn attempt_forward(
        &self,
        step: &SagaStep,
        root: &CorrelationContext,
        payload: &Value,
    ) -> Result<std::result::Result<Value, StepFailure>> {
        let ctx = match derive(root, step.timeout) {
            Ok(ctx) => ctx,
            Err(e) => {
                return Ok(Err(StepFailure::new(
                    FailureCode::DeadlineAlreadyExceeded,
                    e.to_string(),
                )));
            }
        };

        let destination = step.destination();
        let admission = self
            .breakers
            .admit(&self.config.source_id, destination, step.priority)
            .await?;
        if let Admission::Reject(reason) = admission {
            return Ok(Err(StepFailure::new(
                FailureCode::CircuitOpen,
                format!("{destination}: {reason}"),
            )));
        }

        Ok(self
            .call(&step.forward_operation, payload, &ctx, Some(admission))
            .await)
    }

    /// One guarded call: bulkhead lease, hard deadline, breaker report.
    ///
    /// `admission` is `None` for compensations, which never ask the breaker.
    async fn call(
        &self,
        operation: &OperationRef,
        payload: &Value,
        ctx: &CorrelationContext,
        admission: Option<Admission>,
    ) -> std::result::Result<Value, StepFailure> {
        let source = &self.config.source_id;
        let destination = &operation.service;

        let max_wait = self.config.pool_max_wait.min(ctx.remaining());
        let lease = match self.pools.acquire(source, destination, max_wait).await {
            Ok(lease) => lease,
            Err(e) => {
                self.telemetry.emit(TelemetryEvent::PoolRejected {
                    pair: ServicePair::new(source.clone(), destination.clone()),
                });
                self.release_admission(destination, admission).await;
                return Err(StepFailure::new(FailureCode::PoolExhausted, e.to_string()));
            }
        };

        let started = Instant::now();
        let result = within(ctx, self.invoker.invoke(operation, payload, ctx)).await;
        // The lease also releases on drop if this future is cancelled.
        self.pools.release(&lease);
        metrics::histogram!(
            "saga_call_duration_seconds",
            "destination" => destination.to_string()
        )
        .record(started.elapsed().as_secs_f64());

        let (outcome, result) = match result {
            Ok(Ok(output)) => (Some(CallOutcome::Success), Ok(output)),
            // A business rejection means the destination answered.
            Ok(Err(err)) if err.kind == ErrorKind::Permanent => {
                (Some(CallOutcome::Success), Err(StepFailure::from(err)))
            }
            Ok(Err(err)) => (Some(CallOutcome::Failure), Err(StepFailure::from(err))),
            Err(e @ DeadlineError::Exceeded { .. }) => (
                Some(CallOutcome::Failure),
                Err(StepFailure::new(FailureCode::DeadlineExceeded, e.to_string())),
            ),
            Err(e) => (
                None,
                Err(StepFailure::new(
                    FailureCode::DeadlineAlreadyExceeded,
                    e.to_string(),
                )),
            ),
        };

        match outcome {
            Some(outcome) => {
                if let Err(e) = self
                    .breakers
                    .report(source, destination, admission, outcome)
                    .await
                {
                    tracing::warn!(error = %e, %destination, "failed to report call outcome");
                }
            }
            None => self.release_admission(destination, admission).await,
        }
        result
    }

    /// Hands a HALF_OPEN slot back when the admitted call never went out.
    async fn release_admission(&self, destination: &ServiceId, admission: Option<Admission>) {
        let Some(admission) = admission else {
            return;
        };
        if let Err(e) = self
            .breakers
            .release(&self.config.source_id, destination, admission)
            .await
        {
            tracing::warn!(error = %e, %destination, "failed to release breaker slot");
        }
    }

    /// Compensates the next succeeded step, or finishes compensation.
    async fn compensate_next(
        &self,
        definition: &SagaDefinition,
        mut instance: SagaInstance,
    ) -> Result<SagaState> {
        let from = instance.state();
        let Some(index) = instance.next_compensation() else {
            instance.finish_compensation()?;
            self.persist(&mut instance, from).await?;
            return Ok(instance.state());
        };
        let step = definition.get(index).ok_or_else(|| SagaError::InvalidTransition {
            instance_id: instance.id(),
            state: from.to_string(),
            reason: format!("definition has no step {index}"),
        })?;

        let Some(operation) = &step.compensating_operation else {
            tracing::debug!(step = %step.name, "step has no compensation");
            instance.compensate_step(index, 0)?;
            self.persist(&mut instance, from).await?;
            return Ok(instance.state());
        };

        let payload = json!({
            "input": instance.input(),
            "output": instance.steps()[index].output,
        });
        let (result, attempts) = self
            .run_compensation(&instance, step, operation, &payload)
            .await;

        match result {
            Ok(_) => {
                instance.compensate_step(index, attempts)?;
                self.persist(&mut instance, from).await?;
                tracing::info!(instance_id = %instance.id(), step = %step.name, attempts, "step compensated");
                self.telemetry.emit(TelemetryEvent::CompensationOutcome {
                    instance_id: instance.id(),
                    step: step.name.clone(),
                    succeeded: true,
                    attempts,
                });
            }
            Err(failure) => {
                let reason = failure.to_string();
                instance.fail_compensation(index, failure, attempts)?;
                self.persist(&mut instance, from).await?;
                self.telemetry.emit(TelemetryEvent::CompensationOutcome {
                    instance_id: instance.id(),
                    step: step.name.clone(),
                    succeeded: false,
                    attempts,
                });
                self.escalate(&instance, step, reason);
            }
        }
        Ok(instance.state())
    }

    /// Runs a compensation with retries per `compensation_retry`.
    ///
    /// Compensations skip breaker admission and get a fresh deadline per
    /// attempt: the saga deadline may be long gone when they run.
    async fn run_compensation(
        &self,
        instance: &SagaInstance,
        step: &SagaStep,
        operation: &OperationRef,
        payload: &Value,
    ) -> (std::result::Result<Value, StepFailure>, u32) {
        let policy = &self.config.compensation_retry;
        let timeout = chrono::Duration::from_std(step.timeout).unwrap_or(chrono::Duration::MAX);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = Utc::now();
            let ctx = CorrelationContext {
                deadline: now
                    .checked_add_signed(timeout)
                    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
                ..self.root_context(instance)
            };

            match self.call(operation, payload, &ctx, None).await {
                Ok(output) => return (Ok(output), attempt),
                Err(failure) if failure.code.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    metrics::counter!("saga_compensation_retries_total").increment(1);
                    tracing::warn!(step = %step.name, attempt, code = %failure.code, ?delay, "retrying compensation");
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return (Err(failure), attempt),
            }
        }
    }

    fn escalate(&self, instance: &SagaInstance, step: &SagaStep, reason: String) {
        metrics::counter!("saga_escalations_total").increment(1);
        tracing::error!(
            instance_id = %instance.id(),
            trace_id = %instance.trace_id(),
            step = %step.name,
            %reason,
            "compensation exhausted its retries, manual intervention required"
        );
        self.telemetry.emit(TelemetryEvent::Escalation {
            instance_id: instance.id(),
            step: step.name.clone(),
            reason,
        });
    }
}
