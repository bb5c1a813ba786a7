//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// STARTED ──► STEP_i_IN_PROGRESS ──► STEP_i_SUCCEEDED ──► … ──► COMPLETED
///                     │
///                     └──► STEP_i_FAILED ──► COMPENSATING ──┬──► COMPENSATED
///                                                           └──► COMPENSATION_FAILED
/// ```
///
/// Step indices are zero-based. Serialized as the display string, e.g.
/// `"STEP_1_IN_PROGRESS"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "String", try_from = "String")]
pub enum SagaState {
    /// Persisted, no step attempted yet.
    #[default]
    Started,
    StepInProgress(usize),
    StepSucceeded(usize),
    StepFailed(usize),
    /// Undoing succeeded steps in reverse order.
    Compensating,
    /// Every step succeeded (terminal).
    Completed,
    /// Every compensation succeeded; overall failure (terminal).
    Compensated,
    /// A compensation exhausted its retries (terminal, needs an operator).
    CompensationFailed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::CompensationFailed
        )
    }

    /// Returns true while forward steps may still run.
    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            SagaState::Started | SagaState::StepInProgress(_) | SagaState::StepSucceeded(_)
        )
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaState::Started => f.write_str("STARTED"),
            SagaState::StepInProgress(i) => write!(f, "STEP_{i}_IN_PROGRESS"),
            SagaState::StepSucceeded(i) => write!(f, "STEP_{i}_SUCCEEDED"),
            SagaState::StepFailed(i) => write!(f, "STEP_{i}_FAILED"),
            SagaState::Compensating => f.write_str("COMPENSATING"),
            SagaState::Completed => f.write_str("COMPLETED"),
            SagaState::Compensated => f.write_str("COMPENSATED"),
            SagaState::CompensationFailed => f.write_str("COMPENSATION_FAILED"),
        }
    }
}

impl std::str::FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => return Ok(SagaState::Started),
            "COMPENSATING" => return Ok(SagaState::Compensating),
            "COMPLETED" => return Ok(SagaState::Completed),
            "COMPENSATED" => return Ok(SagaState::Compensated),
            "COMPENSATION_FAILED" => return Ok(SagaState::CompensationFailed),
            _ => {}
        }

        let step = |suffix: &str| -> Option<usize> {
            s.strip_prefix("STEP_")?.strip_suffix(suffix)?.parse().ok()
        };
        if let Some(i) = step("_IN_PROGRESS") {
            Ok(SagaState::StepInProgress(i))
        } else if let Some(i) = step("_SUCCEEDED") {
            Ok(SagaState::StepSucceeded(i))
        } else if let Some(i) = step("_FAILED") {
            Ok(SagaState::StepFailed(i))
        } else {
            Err(format!("unknown saga state '{s}'"))
        }
    }
}

impl From<SagaState> for String {
    fn from(state: SagaState) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for SagaState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Outcome of one step within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Compensated,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "PENDING",
            StepOutcome::Succeeded => "SUCCEEDED",
            StepOutcome::Failed => "FAILED",
            StepOutcome::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
