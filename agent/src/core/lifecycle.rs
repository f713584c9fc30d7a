//! Operation classification and the lifecycle events published per attempt.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::InvalidOperationError;
use crate::core::types::{Run, STATUS_APPLY_QUEUED, STATUS_PLAN_QUEUED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Plan,
    Apply,
}

impl Operation {
    /// Maps a queued run status to the operation it dispatches.
    pub fn classify(run: &Run) -> Result<Self, InvalidOperationError> {
        match run.status.as_str() {
            STATUS_PLAN_QUEUED => Ok(Operation::Plan),
            STATUS_APPLY_QUEUED => Ok(Operation::Apply),
            other => Err(InvalidOperationError {
                run_id: run.id.clone(),
                status: other.to_string(),
            }),
        }
    }

    /// Command word handed to the runner. Destroy runs apply as `destroy`.
    pub fn command(self, is_destroy: bool) -> &'static str {
        match (self, is_destroy) {
            (Operation::Plan, _) => "plan",
            (Operation::Apply, false) => "apply",
            (Operation::Apply, true) => "destroy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Plan => "plan",
            Operation::Apply => "apply",
        })
    }
}

/// Registry key for bus subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlanStarted,
    PlanCompleted,
    PlanFailed,
    ApplyStarted,
    ApplyCompleted,
    ApplyFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::PlanStarted,
        EventKind::PlanCompleted,
        EventKind::PlanFailed,
        EventKind::ApplyStarted,
        EventKind::ApplyCompleted,
        EventKind::ApplyFailed,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Completed,
    Failed,
}

/// A state change of a plan or apply, published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub run_id: String,
    pub operation: Operation,
    /// Plan id for plan events, apply id for apply events.
    pub subject_id: String,
    pub transition: Transition,
    /// Failure detail, set only for `Transition::Failed`.
    pub error: Option<String>,
}

impl LifecycleEvent {
    pub fn started(operation: Operation, run: &Run) -> Self {
        Self::new(operation, run, Transition::Started, None)
    }

    pub fn completed(operation: Operation, run: &Run) -> Self {
        Self::new(operation, run, Transition::Completed, None)
    }

    pub fn failed(operation: Operation, run: &Run, error: &anyhow::Error) -> Self {
        Self::new(operation, run, Transition::Failed, Some(format!("{error:#}")))
    }

    fn new(operation: Operation, run: &Run, transition: Transition, error: Option<String>) -> Self {
        let subject_id = match operation {
            Operation::Plan => run.plan_id.clone(),
            Operation::Apply => run.apply_id.clone(),
        };
        Self {
            run_id: run.id.clone(),
            operation,
            subject_id,
            transition,
            error,
        }
    }

    pub fn kind(&self) -> EventKind {
        match (self.operation, self.transition) {
            (Operation::Plan, Transition::Started) => EventKind::PlanStarted,
            (Operation::Plan, Transition::Completed) => EventKind::PlanCompleted,
            (Operation::Plan, Transition::Failed) => EventKind::PlanFailed,
            (Operation::Apply, Transition::Started) => EventKind::ApplyStarted,
            (Operation::Apply, Transition::Completed) => EventKind::ApplyCompleted,
            (Operation::Apply, Transition::Failed) => EventKind::ApplyFailed,
        }
    }
}
