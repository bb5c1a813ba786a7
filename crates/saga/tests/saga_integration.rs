//! Integration tests for saga orchestration over the resilience layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ServiceId;
use resilience::{
    BreakerState, InMemorySink, PoolLimits, ResilienceConfig, RetryPolicy, TelemetryEvent,
};
use saga::{
    Behavior, CancelAck, DefinitionRegistry, FailureCode, OperationRef, OrchestratorConfig,
    SagaDefinition, SagaOrchestrator, SagaState, SagaStep, ScriptedInvoker, StepOutcome,
    WorkerConfig, WorkerPool,
};
use serde_json::json;
use state_store::InMemoryStore;

type TestOrchestrator = SagaOrchestrator<InMemoryStore, ScriptedInvoker>;

const AGENT: &str = "agent-service";
const LEARNING: &str = "learning-service";
const REGISTRY: &str = "registry-service";

fn op(service: &str, name: &str) -> OperationRef {
    OperationRef::new(service, name)
}

fn create_agent_with_setup() -> SagaDefinition {
    SagaDefinition::new("create_agent_with_setup")
        .step(
            SagaStep::new("CreateAgent", op(AGENT, "CreateAgent"), Duration::from_secs(2))
                .with_compensation(op(AGENT, "DeleteAgent")),
        )
        .step(
            SagaStep::new(
                "InitializeLearning",
                op(LEARNING, "InitializeLearning"),
                Duration::from_secs(2),
            )
            .with_compensation(op(LEARNING, "ResetLearning")),
        )
        .step(
            SagaStep::new(
                "RegisterInRegistry",
                op(REGISTRY, "RegisterInRegistry"),
                Duration::from_secs(2),
            )
            .with_compensation(op(REGISTRY, "DeregisterFromRegistry")),
        )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
}

fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        step_retry: fast_retry(),
        compensation_retry: fast_retry(),
        ..OrchestratorConfig::default()
    }
}

/// Breakers that open after three failed calls in a window.
fn sensitive_breakers() -> ResilienceConfig {
    ResilienceConfig {
        breaker_min_samples: 3,
        breaker_threshold: 0.5,
        cool_down: Duration::from_secs(30),
        ..ResilienceConfig::default()
    }
}

/// One replica: an orchestrator bound to a shared store.
struct TestHarness {
    store: InMemoryStore,
    registry: Arc<DefinitionRegistry>,
    invoker: ScriptedInvoker,
    sink: InMemorySink,
    orchestrator: Arc<TestOrchestrator>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(ResilienceConfig::default(), orchestrator_config())
    }

    fn with_config(resilience: ResilienceConfig, config: OrchestratorConfig) -> Self {
        let registry = Arc::new(DefinitionRegistry::new());
        registry.register(create_agent_with_setup()).unwrap();
        Self::build(InMemoryStore::new(), registry, ScriptedInvoker::new(), resilience, config)
    }

    fn build(
        store: InMemoryStore,
        registry: Arc<DefinitionRegistry>,
        invoker: ScriptedInvoker,
        resilience: ResilienceConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let sink = InMemorySink::new();
        let orchestrator = Arc::new(SagaOrchestrator::new(
            store.clone(),
            registry.clone(),
            invoker.clone(),
            resilience,
            config,
            Arc::new(sink.clone()),
        ));
        Self {
            store,
            registry,
            invoker,
            sink,
            orchestrator,
        }
    }

    /// Another replica sharing this one's store, definitions and services.
    fn replica(&self, resilience: ResilienceConfig) -> Self {
        Self::build(
            self.store.clone(),
            self.registry.clone(),
            self.invoker.clone(),
            resilience,
            orchestrator_config(),
        )
    }
}

#[tokio::test]
async fn test_create_agent_with_setup_compensates_created_agent() {
    let h = TestHarness::new();
    h.invoker.set_behavior(
        op(AGENT, "CreateAgent"),
        Behavior::Succeed(json!({"agent_id": "agent-42"})),
    );
    h.invoker.set_behavior(
        op(LEARNING, "InitializeLearning"),
        Behavior::FailPermanently("unsupported model".into()),
    );

    let status = h
        .orchestrator
        .execute("create_agent_with_setup", json!({"name": "scout"}))
        .await
        .unwrap();

    assert_eq!(status.state, SagaState::Compensated);
    assert_eq!(
        status.step_outcomes.get("CreateAgent"),
        Some(StepOutcome::Compensated)
    );
    assert_eq!(
        status.step_outcomes.get("InitializeLearning"),
        Some(StepOutcome::Failed)
    );
    assert_eq!(
        status.step_outcomes.get("RegisterInRegistry"),
        Some(StepOutcome::Pending)
    );

    assert_eq!(
        h.invoker.called_operations(),
        vec!["CreateAgent", "InitializeLearning", "DeleteAgent"]
    );
    let delete = h
        .invoker
        .calls()
        .into_iter()
        .find(|c| c.operation.operation == "DeleteAgent")
        .unwrap();
    assert_eq!(delete.input["output"]["agent_id"], "agent-42");

    let failure = status.failure.unwrap();
    assert_eq!(failure.step, "InitializeLearning");
    assert_eq!(failure.code, FailureCode::Permanent);

    let body = serde_json::to_value(
        h.orchestrator
            .get_saga_status(status.instance_id)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body["state"], "COMPENSATED");
    assert_eq!(
        body["step_outcomes"],
        json!({
            "CreateAgent": "COMPENSATED",
            "InitializeLearning": "FAILED",
            "RegisterInRegistry": "PENDING"
        })
    );
}

#[tokio::test]
async fn test_compensations_run_in_reverse_order() {
    let h = TestHarness::new();
    h.invoker.set_behavior(
        op(REGISTRY, "RegisterInRegistry"),
        Behavior::FailPermanently("duplicate name".into()),
    );

    let status = h
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    assert_eq!(status.state, SagaState::Compensated);
    assert_eq!(
        h.invoker.called_operations(),
        vec![
            "CreateAgent",
            "InitializeLearning",
            "RegisterInRegistry",
            "ResetLearning",
            "DeleteAgent"
        ]
    );
    let compensated: Vec<String> = h
        .sink
        .events_of_kind("compensation_outcome")
        .into_iter()
        .filter_map(|e| match e {
            TelemetryEvent::CompensationOutcome {
                step, succeeded, ..
            } if succeeded => Some(step),
            _ => None,
        })
        .collect();
    assert_eq!(compensated, vec!["InitializeLearning", "CreateAgent"]);
}

#[tokio::test]
async fn test_resume_on_another_replica_skips_succeeded_steps() {
    let replica_a = TestHarness::new();
    let id = replica_a
        .orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    // Replica A completes one step, then goes away.
    assert_eq!(
        replica_a.orchestrator.advance(id).await.unwrap(),
        SagaState::StepSucceeded(0)
    );
    drop(replica_a.orchestrator);

    let replica_b = TestHarness::build(
        replica_a.store.clone(),
        replica_a.registry.clone(),
        replica_a.invoker.clone(),
        ResilienceConfig::default(),
        orchestrator_config(),
    );
    let status = replica_b.orchestrator.run(id).await.unwrap();

    assert_eq!(status.state, SagaState::Completed);
    assert_eq!(replica_b.invoker.call_count(&op(AGENT, "CreateAgent")), 1);
    assert_eq!(
        replica_b.invoker.called_operations(),
        vec!["CreateAgent", "InitializeLearning", "RegisterInRegistry"]
    );
}

#[tokio::test]
async fn test_resume_after_crash_mid_step_reruns_only_that_step() {
    let h = TestHarness::new();
    let id = h
        .orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    h.orchestrator.advance(id).await.unwrap();

    // A replica persisted STEP_1_IN_PROGRESS and crashed before the call returned.
    let repository = h.orchestrator.repository();
    let mut instance = repository.load(id).await.unwrap().unwrap();
    let index = instance.resume_point();
    instance.begin_step(index).unwrap();
    repository.save(&mut instance).await.unwrap();
    assert_eq!(
        h.orchestrator.get_saga_status(id).await.unwrap().state,
        SagaState::StepInProgress(1)
    );

    let status = h.orchestrator.run(id).await.unwrap();

    assert_eq!(status.state, SagaState::Completed);
    assert_eq!(h.invoker.call_count(&op(AGENT, "CreateAgent")), 1);
    assert_eq!(h.invoker.call_count(&op(LEARNING, "InitializeLearning")), 1);
}

#[tokio::test]
async fn test_resumed_run_reaches_same_terminal_state() {
    let uninterrupted = TestHarness::new();
    uninterrupted.invoker.set_behavior(
        op(REGISTRY, "RegisterInRegistry"),
        Behavior::FailPermanently("rejected".into()),
    );
    let expected = uninterrupted
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    let interrupted = TestHarness::new();
    interrupted.invoker.set_behavior(
        op(REGISTRY, "RegisterInRegistry"),
        Behavior::FailPermanently("rejected".into()),
    );
    let id = interrupted
        .orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    interrupted.orchestrator.advance(id).await.unwrap();
    interrupted.orchestrator.advance(id).await.unwrap();
    let resumed = interrupted.replica(ResilienceConfig::default());
    let actual = resumed.orchestrator.run(id).await.unwrap();

    assert_eq!(actual.state, expected.state);
    assert_eq!(actual.step_outcomes, expected.step_outcomes);
}

#[tokio::test]
async fn test_failing_destination_opens_breaker_shared_by_replicas() {
    let replica_a = TestHarness::with_config(sensitive_breakers(), orchestrator_config());
    replica_a
        .invoker
        .set_behavior(op(REGISTRY, "RegisterInRegistry"), Behavior::unavailable());

    let first = replica_a
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    assert_eq!(first.state, SagaState::Compensated);
    assert_eq!(
        replica_a
            .invoker
            .call_count(&op(REGISTRY, "RegisterInRegistry")),
        3
    );

    let source = ServiceId::new("saga-orchestrator");
    let destination = ServiceId::new(REGISTRY);
    let record = replica_a
        .orchestrator
        .breakers()
        .record(&source, &destination)
        .await
        .unwrap();
    assert_eq!(record.state, BreakerState::Open);

    // Replica B reads the same breaker and never calls the registry.
    let replica_b = replica_a.replica(sensitive_breakers());
    let second = replica_b
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    assert_eq!(second.state, SagaState::Compensated);
    assert_eq!(second.failure.unwrap().code, FailureCode::CircuitOpen);
    assert_eq!(
        replica_b
            .invoker
            .call_count(&op(REGISTRY, "RegisterInRegistry")),
        3
    );
    let rejections = replica_b
        .sink
        .events_of_kind("admit_decision")
        .into_iter()
        .filter(|e| matches!(e, TelemetryEvent::AdmitDecision { admitted: false, .. }))
        .count();
    assert_eq!(rejections, 3);
}

#[tokio::test]
async fn test_breaker_closes_after_cool_down_and_successful_probe() {
    let resilience = ResilienceConfig {
        cool_down: Duration::from_millis(50),
        ..sensitive_breakers()
    };
    let h = TestHarness::with_config(resilience, orchestrator_config());
    h.invoker
        .set_behavior(op(REGISTRY, "RegisterInRegistry"), Behavior::unavailable());
    h.orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    let source = ServiceId::new("saga-orchestrator");
    let destination = ServiceId::new(REGISTRY);
    let breakers = h.orchestrator.breakers();
    assert_eq!(
        breakers.record(&source, &destination).await.unwrap().state,
        BreakerState::Open
    );

    // The registry recovers; after the cool-down one probe closes the breaker.
    h.invoker.set_behavior(
        op(REGISTRY, "RegisterInRegistry"),
        Behavior::Succeed(json!({"registered": true})),
    );
    tokio::time::sleep(Duration::from_millis(80)).await;

    let status = h
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    assert_eq!(status.state, SagaState::Completed);
    assert_eq!(
        breakers.record(&source, &destination).await.unwrap().state,
        BreakerState::Closed
    );
}

#[tokio::test]
async fn test_cancellation_is_observed_at_step_boundary() {
    let h = TestHarness::new();
    let id = h
        .orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    h.orchestrator.advance(id).await.unwrap();

    assert_eq!(
        h.orchestrator.cancel_saga(id).await.unwrap(),
        CancelAck::Requested
    );
    // A repeated request changes nothing.
    assert_eq!(
        h.orchestrator.cancel_saga(id).await.unwrap(),
        CancelAck::Requested
    );

    let status = h.orchestrator.run(id).await.unwrap();

    assert_eq!(status.state, SagaState::Compensated);
    assert_eq!(
        status.step_outcomes.get("CreateAgent"),
        Some(StepOutcome::Compensated)
    );
    assert_eq!(
        status.step_outcomes.get("InitializeLearning"),
        Some(StepOutcome::Pending)
    );
    assert_eq!(status.failure.unwrap().code, FailureCode::Cancelled);
    assert_eq!(
        h.invoker.called_operations(),
        vec!["CreateAgent", "DeleteAgent"]
    );
}

#[tokio::test]
async fn test_exhausted_saga_budget_fails_fast_without_calling() {
    let config = OrchestratorConfig {
        saga_timeout: Duration::ZERO,
        ..orchestrator_config()
    };
    let h = TestHarness::with_config(ResilienceConfig::default(), config);

    let status = h
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    assert_eq!(status.state, SagaState::Compensated);
    let failure = status.failure.unwrap();
    assert_eq!(failure.step, "CreateAgent");
    assert_eq!(failure.code, FailureCode::DeadlineAlreadyExceeded);
    assert!(h.invoker.calls().is_empty());
}

#[tokio::test]
async fn test_step_deadlines_never_exceed_saga_deadline() {
    let config = OrchestratorConfig {
        saga_timeout: Duration::from_millis(500),
        ..orchestrator_config()
    };
    let h = TestHarness::with_config(ResilienceConfig::default(), config);

    let status = h
        .orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    assert_eq!(status.state, SagaState::Completed);

    let calls = h.invoker.calls();
    let root_deadline = calls[0].deadline;
    for call in &calls {
        assert_eq!(call.trace_id, status.trace_id);
        assert!(call.deadline <= root_deadline);
        assert!(call.parent_span_id.is_some());
    }
}

#[tokio::test]
async fn test_slow_step_exceeds_its_deadline() {
    let definition = SagaDefinition::new("slow").step(SagaStep::new(
        "Train",
        op(LEARNING, "Train"),
        Duration::from_millis(30),
    ));
    let h = TestHarness::new();
    h.registry.register(definition).unwrap();
    h.invoker.set_behavior(
        op(LEARNING, "Train"),
        Behavior::Delay {
            duration: Duration::from_secs(10),
            then: json!(null),
        },
    );

    let started = Instant::now();
    let status = h.orchestrator.execute("slow", json!({})).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status.state, SagaState::Compensated);
    assert_eq!(status.failure.unwrap().code, FailureCode::DeadlineExceeded);
    assert_eq!(h.invoker.call_count(&op(LEARNING, "Train")), 3);

    let record = h
        .orchestrator
        .breakers()
        .record(&ServiceId::new("saga-orchestrator"), &ServiceId::new(LEARNING))
        .await
        .unwrap();
    assert_eq!(record.error_count, 3);
}

#[tokio::test]
async fn test_exhausted_pool_does_not_block_other_destinations() {
    let source = ServiceId::new("saga-orchestrator");
    let resilience = ResilienceConfig::default().with_pool_override(
        common::ServicePair::new(source.clone(), ServiceId::new("slow-service")),
        PoolLimits {
            capacity: 1,
            queue_depth: 0,
        },
    );
    let h = TestHarness::with_config(resilience, orchestrator_config());
    h.registry
        .register(SagaDefinition::new("slow").step(SagaStep::new(
            "Wait",
            op("slow-service", "Wait"),
            Duration::from_secs(5),
        )))
        .unwrap();
    h.registry
        .register(SagaDefinition::new("fast").step(SagaStep::new(
            "Ping",
            op("fast-service", "Ping"),
            Duration::from_secs(5),
        )))
        .unwrap();
    h.invoker.set_behavior(
        op("slow-service", "Wait"),
        Behavior::Delay {
            duration: Duration::from_millis(500),
            then: json!("done"),
        },
    );

    let orchestrator = h.orchestrator.clone();
    let slow = tokio::spawn(async move { orchestrator.execute("slow", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pools = h.orchestrator.pools();
    let slow_pool = pools
        .stats(&source, &ServiceId::new("slow-service"))
        .unwrap();
    assert_eq!(slow_pool.in_use, 1);

    // A second caller for the saturated destination is turned away.
    let rejected = h.orchestrator.execute("slow", json!({})).await.unwrap();
    assert_eq!(rejected.failure.unwrap().code, FailureCode::PoolExhausted);

    let started = Instant::now();
    let fast = h.orchestrator.execute("fast", json!({})).await.unwrap();
    assert_eq!(fast.state, SagaState::Completed);
    assert!(started.elapsed() < Duration::from_millis(200));

    assert_eq!(slow.await.unwrap().unwrap().state, SagaState::Completed);
    assert!(!h.sink.events_of_kind("pool_rejected").is_empty());
}

#[tokio::test]
async fn test_worker_pools_split_instances_between_replicas() {
    let h = TestHarness::new();
    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(
            h.orchestrator
                .start_saga("create_agent_with_setup", json!({"n": n}))
                .await
                .unwrap(),
        );
    }
    let other = h.replica(ResilienceConfig::default());

    let pool_0 = WorkerPool::new(
        h.orchestrator.clone(),
        WorkerConfig {
            replica_index: 0,
            replica_count: 2,
            ..WorkerConfig::default()
        },
    );
    let pool_1 = WorkerPool::new(
        other.orchestrator.clone(),
        WorkerConfig {
            replica_index: 1,
            replica_count: 2,
            ..WorkerConfig::default()
        },
    );

    let report_0 = pool_0.run_once().await.unwrap();
    let report_1 = pool_1.run_once().await.unwrap();

    assert_eq!(report_0.owned + report_1.owned, 10);
    assert_eq!(report_0.resumed + report_1.resumed, 10);
    assert_eq!(report_0.failed + report_1.failed, 0);
    for id in ids {
        assert_eq!(
            h.orchestrator.get_saga_status(id).await.unwrap().state,
            SagaState::Completed
        );
    }
    assert_eq!(h.invoker.call_count(&op(AGENT, "CreateAgent")), 10);

    // Nothing is left to resume.
    let again = pool_0.run_once().await.unwrap();
    assert_eq!(again.resumed, 0);
    assert_eq!(again.skipped, report_0.owned);
}

#[tokio::test]
async fn test_worker_stops_loading_finished_instances() {
    let h = TestHarness::new();
    h.orchestrator
        .execute("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    h.orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    let pool = WorkerPool::new(h.orchestrator.clone(), WorkerConfig::default());

    let first = pool.run_once().await.unwrap();
    assert_eq!((first.owned, first.resumed, first.skipped), (2, 1, 0));

    let second = pool.run_once().await.unwrap();
    assert_eq!((second.owned, second.resumed, second.skipped), (2, 0, 2));

    h.orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();
    let third = pool.run_once().await.unwrap();
    assert_eq!((third.owned, third.resumed, third.skipped), (3, 1, 2));
    assert_eq!(h.invoker.call_count(&op(AGENT, "CreateAgent")), 3);
}

#[tokio::test]
async fn test_spawned_worker_stops_on_shutdown() {
    let h = TestHarness::new();
    let id = h
        .orchestrator
        .start_saga("create_agent_with_setup", json!({}))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = WorkerPool::new(
        h.orchestrator.clone(),
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
    )
    .spawn(shutdown_rx);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.orchestrator.get_saga_status(id).await.unwrap().state != SagaState::Completed {
        assert!(Instant::now() < deadline, "worker never completed the saga");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
