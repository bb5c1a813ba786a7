//! Step invocation interface and a scripted in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SpanId, TraceId};
use resilience::CorrelationContext;
use serde_json::Value;

use crate::definition::OperationRef;
use crate::error::StepError;

/// Calls an operation of an external service.
///
/// Implementations must honour the deadline carried in `ctx` and return
/// promptly when the returned future is dropped.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(
        &self,
        operation: &OperationRef,
        input: &Value,
        ctx: &CorrelationContext,
    ) -> Result<Value, StepError>;
}

#[async_trait]
impl<T: StepInvoker + ?Sized> StepInvoker for Arc<T> {
    async fn invoke(
        &self,
        operation: &OperationRef,
        input: &Value,
        ctx: &CorrelationContext,
    ) -> Result<Value, StepError> {
        (**self).invoke(operation, input, ctx).await
    }
}

/// How a scripted operation responds.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Succeed(Value),
    FailPermanently(String),
    /// Fails transiently `failures` times, then succeeds with `then`.
    FailTransiently { failures: u32, then: Value },
    /// Takes `duration` to answer `then`, giving up at the context deadline.
    Delay { duration: Duration, then: Value },
}

impl Behavior {
    /// Fails transiently on every call.
    pub fn unavailable() -> Self {
        Behavior::FailTransiently {
            failures: u32::MAX,
            then: Value::Null,
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub operation: OperationRef,
    pub input: Value,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ScriptState {
    behaviors: HashMap<OperationRef, Behavior>,
    attempts: HashMap<OperationRef, u32>,
    calls: Vec<Invocation>,
}

/// In-memory invoker answering from per-operation scripts.
///
/// Operations without a script succeed with `{"operation": "<service>.<op>"}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInvoker {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the behavior of one operation, resetting its attempt count.
    pub fn set_behavior(&self, operation: OperationRef, behavior: Behavior) {
        let mut state = self.lock();
        state.attempts.remove(&operation);
        state.behaviors.insert(operation, behavior);
    }

    /// Builder form of `set_behavior`.
    pub fn with(self, operation: OperationRef, behavior: Behavior) -> Self {
        self.set_behavior(operation, behavior);
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.lock().calls.clone()
    }

    /// Names of the called operations, in order.
    pub fn called_operations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|c| c.operation.operation.clone())
            .collect()
    }

    pub fn call_count(&self, operation: &OperationRef) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| &c.operation == operation)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StepInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        operation: &OperationRef,
        input: &Value,
        ctx: &CorrelationContext,
    ) -> Result<Value, StepError> {
        let (behavior, attempt) = {
            let mut state = self.lock();
            state.calls.push(Invocation {
                operation: operation.clone(),
                input: input.clone(),
                trace_id: ctx.trace_id,
                span_id: ctx.span_id,
                parent_span_id: ctx.parent_span_id,
                deadline: ctx.deadline,
            });
            let attempt = state.attempts.entry(operation.clone()).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            (state.behaviors.get(operation).cloned(), attempt)
        };

        match behavior {
            None => Ok(serde_json::json!({ "operation": operation.to_string() })),
            Some(Behavior::Succeed(output)) => Ok(output),
            Some(Behavior::FailPermanently(reason)) => Err(StepError::permanent(reason)),
            Some(Behavior::FailTransiently { failures, then }) => {
                if attempt <= failures {
                    Err(StepError::transient(format!(
                        "{operation} unavailable (attempt {attempt})"
                    )))
                } else {
                    Ok(then)
                }
            }
            Some(Behavior::Delay { duration, then }) => {
                let budget = ctx.remaining();
                if duration > budget {
                    tokio::time::sleep(budget).await;
                    return Err(StepError::deadline_exceeded(format!(
                        "{operation} needs {duration:?}, {budget:?} left"
                    )));
                }
                tokio::time::sleep(duration).await;
                Ok(then)
            }
        }
    }
}
