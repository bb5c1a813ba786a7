//! Built-in saga definitions served by the binary.
//!
//! The binary answers outbound calls with a `saga::ScriptedInvoker`; real
//! deployments supply a [`saga::StepInvoker`] per vertical service.

use std::sync::Arc;
use std::time::Duration;

use saga::{DefinitionRegistry, OperationRef, Result, SagaDefinition, SagaStep};

pub const AGENT_SERVICE: &str = "agent-service";
pub const LEARNING_SERVICE: &str = "learning-service";
pub const REGISTRY_SERVICE: &str = "registry-service";

/// Creates an agent, initializes its learning state and registers it.
pub fn create_agent_with_setup() -> SagaDefinition {
    let timeout = Duration::from_secs(10);
    SagaDefinition::new("create_agent_with_setup")
        .step(
            SagaStep::new(
                "CreateAgent",
                OperationRef::new(AGENT_SERVICE, "CreateAgent"),
                timeout,
            )
            .with_compensation(OperationRef::new(AGENT_SERVICE, "DeleteAgent")),
        )
        .step(
            SagaStep::new(
                "InitializeLearning",
                OperationRef::new(LEARNING_SERVICE, "InitializeLearning"),
                timeout,
            )
            .with_compensation(OperationRef::new(LEARNING_SERVICE, "ResetLearning")),
        )
        .step(
            SagaStep::new(
                "RegisterInRegistry",
                OperationRef::new(REGISTRY_SERVICE, "RegisterInRegistry"),
                timeout,
            )
            .with_compensation(OperationRef::new(REGISTRY_SERVICE, "DeregisterFromRegistry")),
        )
}

/// A registry holding every built-in definition.
pub fn registry() -> Result<Arc<DefinitionRegistry>> {
    let registry = DefinitionRegistry::new();
    registry.register(create_agent_with_setup())?;
    Ok(Arc::new(registry))
}
