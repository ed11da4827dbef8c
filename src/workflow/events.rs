//! Workflow Events
//!
//! Events emitted by the saga engine so external consumers can follow step
//! and compensation progress.

use super::graph::StepToken;
use serde::{Deserialize, Serialize};

/// Outcome of a finished workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded,
    Compensated,
    CompensationIncomplete,
}

impl std::fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowOutcome::Succeeded => write!(f, "succeeded"),
            WorkflowOutcome::Compensated => write!(f, "compensated"),
            WorkflowOutcome::CompensationIncomplete => write!(f, "compensation_incomplete"),
        }
    }
}

/// Events emitted by the saga engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// A step began its forward action
    StepStarted {
        workflow_id: String,
        step: StepToken,
        label: String,
    },

    StepSucceeded {
        workflow_id: String,
        step: StepToken,
    },

    StepFailed {
        workflow_id: String,
        step: StepToken,
        reason: String,
    },

    /// A step never started because the saga had already failed
    StepCancelled {
        workflow_id: String,
        step: StepToken,
    },

    RollbackStarted {
        workflow_id: String,
        step: StepToken,
    },

    RolledBack {
        workflow_id: String,
        step: StepToken,
    },

    RollbackFailed {
        workflow_id: String,
        step: StepToken,
        reason: String,
    },

    WorkflowCompleted {
        workflow_id: String,
        outcome: WorkflowOutcome,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::StepStarted { workflow_id, .. }
            | WorkflowEvent::StepSucceeded { workflow_id, .. }
            | WorkflowEvent::StepFailed { workflow_id, .. }
            | WorkflowEvent::StepCancelled { workflow_id, .. }
            | WorkflowEvent::RollbackStarted { workflow_id, .. }
            | WorkflowEvent::RolledBack { workflow_id, .. }
            | WorkflowEvent::RollbackFailed { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id, .. } => workflow_id,
        }
    }

    /// Step the event refers to, if any
    pub fn step(&self) -> Option<StepToken> {
        match self {
            WorkflowEvent::StepStarted { step, .. }
            | WorkflowEvent::StepSucceeded { step, .. }
            | WorkflowEvent::StepFailed { step, .. }
            | WorkflowEvent::StepCancelled { step, .. }
            | WorkflowEvent::RollbackStarted { step, .. }
            | WorkflowEvent::RolledBack { step, .. }
            | WorkflowEvent::RollbackFailed { step, .. } => Some(*step),
            WorkflowEvent::WorkflowCompleted { .. } => None,
        }
    }

    /// Check if this event belongs to the compensation wave
    pub fn is_rollback_event(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RollbackStarted { .. }
                | WorkflowEvent::RolledBack { .. }
                | WorkflowEvent::RollbackFailed { .. }
        )
    }
}
