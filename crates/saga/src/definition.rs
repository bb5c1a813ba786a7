//! Saga definitions and the registry that holds them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use common::ServiceId;
use resilience::Priority;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// Reference to an operation exposed by an external service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    pub service: ServiceId,
    pub operation: String,
}

impl OperationRef {
    pub fn new(service: impl Into<ServiceId>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for OperationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.operation)
    }
}

/// One step of a saga.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStep {
    pub name: String,
    pub forward_operation: OperationRef,
    pub compensating_operation: Option<OperationRef>,
    pub timeout: Duration,
    /// Admission priority of the forward call. Compensations skip admission.
    pub priority: Priority,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, forward_operation: OperationRef, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            forward_operation,
            compensating_operation: None,
            timeout,
            priority: Priority::Normal,
        }
    }

    pub fn with_compensation(mut self, operation: OperationRef) -> Self {
        self.compensating_operation = Some(operation);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The service the forward operation calls.
    pub fn destination(&self) -> &ServiceId {
        &self.forward_operation.service
    }
}

/// An ordered list of steps, identified by name.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaDefinition {
    id: String,
    steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&SagaStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checks the definition can be executed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SagaError::InvalidDefinition {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required".to_string()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(invalid("step names must not be empty".to_string()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
            if step.timeout.is_zero() {
                return Err(invalid(format!("step '{}' has a zero timeout", step.name)));
            }
        }
        Ok(())
    }
}

/// Registered definitions, looked up by id.
///
/// A definition cannot be replaced once registered, so running instances
/// always see the steps they were started with.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition.
    pub fn register(&self, definition: SagaDefinition) -> Result<()> {
        definition.validate()?;

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(definition.id()) {
            return Err(SagaError::DefinitionAlreadyRegistered(
                definition.id().to_string(),
            ));
        }

        tracing::info!(
            definition_id = definition.id(),
            steps = definition.len(),
            "saga definition registered"
        );
        definitions.insert(definition.id().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
