//! Step Lifecycle
//!
//! ```text
//! Created -> Queued -> Executing -> Succeeded | Failed
//! Succeeded -> RollingBack -> RolledBack | RollbackFailed
//! Created | Queued -> Cancelled
//! ```

use super::graph::StepToken;
use super::invocation::Invocation;
use crate::domain::model::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Queued,
    Executing,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
    /// Never started because the saga failed first
    Cancelled,
}

impl StepState {
    pub fn can_transition_to(&self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Executing)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Succeeded, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
                | (Created, Cancelled)
                | (Queued, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Created => "created",
            StepState::Queued => "queued",
            StepState::Executing => "executing",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::RollingBack => "rolling_back",
            StepState::RolledBack => "rolled_back",
            StepState::RollbackFailed => "rollback_failed",
            StepState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one step as reported back to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub token: StepToken,
    pub label: String,
    pub resource: ResourceId,
    pub forward: Invocation,
    pub state: StepState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}
