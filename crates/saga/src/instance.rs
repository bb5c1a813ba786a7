//! Saga instance: a finite-state machine over the steps of one definition.
//!
//! Every transition method checks its preconditions and leaves the instance
//! untouched on error, so a persisted instance always satisfies:
//! - `current_step_index` only moves forward, except during compensation
//!   where it moves back one succeeded step at a time;
//! - a COMPENSATED step never becomes SUCCEEDED again.

use chrono::{DateTime, Utc};
use common::{InstanceId, TraceId};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use state_store::Version;

use crate::definition::SagaDefinition;
use crate::error::{FailureCode, Result, SagaError, StepFailure};
use crate::state::{SagaState, StepOutcome};

/// Progress of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    /// Forward call attempts made, including retries.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub compensation_attempts: u32,
    /// Result of the forward call, passed to the compensation.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// A failure pinned to the step it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step: String,
    pub code: FailureCode,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    fn new(step: &str, failure: StepFailure) -> Self {
        Self {
            step: step.to_string(),
            code: failure.code,
            message: failure.message,
            at: Utc::now(),
        }
    }
}

/// A persisted saga execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    id: InstanceId,
    definition_id: String,
    state: SagaState,
    current_step_index: usize,
    steps: Vec<StepRecord>,
    input: serde_json::Value,
    trace_id: TraceId,
    /// Absolute deadline of the whole forward path.
    deadline: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Why forward progress stopped.
    #[serde(default)]
    failure: Option<FailureRecord>,
    /// Why compensation gave up.
    #[serde(default)]
    escalation: Option<FailureRecord>,
    #[serde(skip)]
    version: Version,
}

impl SagaInstance {
    /// Creates a new instance in STARTED with every step PENDING.
    pub fn new(
        definition: &SagaDefinition,
        input: serde_json::Value,
        saga_timeout: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let budget = chrono::Duration::from_std(saga_timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            id: InstanceId::new(),
            definition_id: definition.id().to_string(),
            state: SagaState::Started,
            current_step_index: 0,
            steps: definition
                .steps()
                .iter()
                .map(|step| StepRecord {
                    name: step.name.clone(),
                    outcome: StepOutcome::Pending,
                    attempts: 0,
                    compensation_attempts: 0,
                    output: None,
                })
                .collect(),
            input,
            trace_id: TraceId::new(),
            deadline: now.checked_add_signed(budget).unwrap_or(DateTime::<Utc>::MAX_UTC),
            created_at: now,
            updated_at: now,
            failure: None,
            escalation: None,
            version: Version::initial(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> SagaError {
        SagaError::InvalidTransition {
            instance_id: self.id,
            state: self.state.to_string(),
            reason: reason.into(),
        }
    }

    fn record(&self, index: usize) -> Result<&StepRecord> {
        self.steps
            .get(index)
            .ok_or_else(|| self.invalid(format!("step {index} does not exist")))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves the cursor past steps that already succeeded and returns it.
    pub fn resume_point(&mut self) -> usize {
        while self
            .steps
            .get(self.current_step_index)
            .is_some_and(|s| s.outcome == StepOutcome::Succeeded)
        {
            self.current_step_index += 1;
        }
        self.current_step_index
    }

    /// STARTED / STEP_{i-1}_SUCCEEDED / STEP_i_IN_PROGRESS → STEP_i_IN_PROGRESS.
    pub fn begin_step(&mut self, index: usize) -> Result<()> {
        if !self.state.is_forward() {
            return Err(self.invalid("forward steps are closed"));
        }
        if index != self.current_step_index {
            return Err(self.invalid(format!(
                "step {index} is not the current step {}",
                self.current_step_index
            )));
        }
        if self.record(index)?.outcome != StepOutcome::Pending {
            return Err(self.invalid(format!("step {index} is not pending")));
        }
        self.state = SagaState::StepInProgress(index);
        self.touch();
        Ok(())
    }

    /// STEP_i_IN_PROGRESS → STEP_i_SUCCEEDED, advancing the cursor.
    pub fn succeed_step(
        &mut self,
        index: usize,
        output: serde_json::Value,
        attempts: u32,
    ) -> Result<()> {
        if self.state != SagaState::StepInProgress(index) {
            return Err(self.invalid(format!("step {index} is not in progress")));
        }
        let step = &mut self.steps[index];
        step.outcome = StepOutcome::Succeeded;
        step.attempts += attempts;
        step.output = Some(output);
        self.current_step_index = index + 1;
        self.state = SagaState::StepSucceeded(index);
        self.touch();
        Ok(())
    }

    /// STEP_i_IN_PROGRESS → STEP_i_FAILED.
    pub fn fail_step(&mut self, index: usize, failure: StepFailure, attempts: u32) -> Result<()> {
        if self.state != SagaState::StepInProgress(index) {
            return Err(self.invalid(format!("step {index} is not in progress")));
        }
        let step = &mut self.steps[index];
        step.outcome = StepOutcome::Failed;
        step.attempts += attempts;
        self.failure = Some(FailureRecord::new(&step.name, failure));
        self.state = SagaState::StepFailed(index);
        self.touch();
        Ok(())
    }

    /// STEP_i_FAILED → COMPENSATING.
    pub fn begin_compensation(&mut self) -> Result<()> {
        if !matches!(self.state, SagaState::StepFailed(_)) {
            return Err(self.invalid("only a failed step starts compensation"));
        }
        self.state = SagaState::Compensating;
        self.touch();
        Ok(())
    }

    /// Forward state → COMPENSATING without touching the current step.
    ///
    /// Called at a step boundary: the current step is not running, so it
    /// stays PENDING.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.state.is_forward() {
            return Err(self.invalid("only a running saga can be cancelled"));
        }
        let step = self
            .steps
            .get(self.current_step_index)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        self.failure = Some(FailureRecord::new(
            &step,
            StepFailure::new(FailureCode::Cancelled, "cancelled by request"),
        ));
        self.state = SagaState::Compensating;
        self.touch();
        Ok(())
    }

    /// The next step to compensate: the highest SUCCEEDED step before the cursor.
    pub fn next_compensation(&self) -> Option<usize> {
        if self.state != SagaState::Compensating {
            return None;
        }
        let upper = self.current_step_index.min(self.steps.len());
        (0..upper)
            .rev()
            .find(|&i| self.steps[i].outcome == StepOutcome::Succeeded)
    }

    /// Marks a step COMPENSATED and moves the cursor back onto it.
    pub fn compensate_step(&mut self, index: usize, attempts: u32) -> Result<()> {
        if self.next_compensation() != Some(index) {
            return Err(self.invalid(format!("step {index} is not next to compensate")));
        }
        let step = &mut self.steps[index];
        step.outcome = StepOutcome::Compensated;
        step.compensation_attempts += attempts;
        self.current_step_index = index;
        self.touch();
        Ok(())
    }

    /// COMPENSATING → COMPENSATION_FAILED.
    pub fn fail_compensation(
        &mut self,
        index: usize,
        failure: StepFailure,
        attempts: u32,
    ) -> Result<()> {
        if self.next_compensation() != Some(index) {
            return Err(self.invalid(format!("step {index} is not next to compensate")));
        }
        let step = &mut self.steps[index];
        step.compensation_attempts += attempts;
        self.escalation = Some(FailureRecord::new(&step.name, failure));
        self.state = SagaState::CompensationFailed;
        self.touch();
        Ok(())
    }

    /// COMPENSATING → COMPENSATED once nothing is left to undo.
    pub fn finish_compensation(&mut self) -> Result<()> {
        if self.state != SagaState::Compensating {
            return Err(self.invalid("not compensating"));
        }
        if let Some(index) = self.next_compensation() {
            return Err(self.invalid(format!("step {index} still needs compensation")));
        }
        self.state = SagaState::Compensated;
        self.touch();
        Ok(())
    }

    /// Last step succeeded → COMPLETED.
    pub fn complete(&mut self) -> Result<()> {
        if !self.state.is_forward() || self.current_step_index < self.steps.len() {
            return Err(self.invalid("steps remain"));
        }
        self.state = SagaState::Completed;
        self.touch();
        Ok(())
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn escalation(&self) -> Option<&FailureRecord> {
        self.escalation.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Outputs of every succeeded step, keyed by step name.
    pub fn results(&self) -> serde_json::Map<String, serde_json::Value> {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Succeeded)
            .filter_map(|s| Some((s.name.clone(), s.output.clone()?)))
            .collect()
    }

    /// Snapshot for callers.
    pub fn status(&self) -> SagaStatus {
        SagaStatus {
            instance_id: self.id,
            definition_id: self.definition_id.clone(),
            state: self.state,
            current_step: self
                .steps
                .get(self.current_step_index)
                .map(|s| s.name.clone()),
            current_step_index: self.current_step_index,
            step_outcomes: StepOutcomes(
                self.steps
                    .iter()
                    .map(|s| (s.name.clone(), s.outcome))
                    .collect(),
            ),
            failure: self.failure.clone(),
            escalation: self.escalation.clone(),
            trace_id: self.trace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Step outcomes in declaration order. Serializes as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcomes(Vec<(String, StepOutcome)>);

impl StepOutcomes {
    pub fn get(&self, step: &str) -> Option<StepOutcome> {
        self.0
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, outcome)| *outcome)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StepOutcome)> {
        self.0.iter().map(|(name, outcome)| (name.as_str(), *outcome))
    }
}

impl Serialize for StepOutcomes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, outcome) in &self.0 {
            map.serialize_entry(name, outcome)?;
        }
        map.end()
    }
}

/// What `get_saga_status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct SagaStatus {
    pub instance_id: InstanceId,
    pub definition_id: String,
    pub state: SagaState,
    /// Name of the step at the cursor, if any remain.
    pub current_step: Option<String>,
    pub current_step_index: usize,
    pub step_outcomes: StepOutcomes,
    pub failure: Option<FailureRecord>,
    pub escalation: Option<FailureRecord>,
    pub trace_id: TraceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
