//! Status enums for Tasks and the worker-side iteration loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task as tracked by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task submitted, waiting for a free execution slot.
    #[default]
    Pending,
    /// Task has a live container.
    Running,
    /// Worker finished and all completion checks passed.
    Completed,
    /// Task failed (provisioning, worker failure, exhaustion, stagnation).
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
    /// Worker reported that the agent is stuck.
    Blocked,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked
        )
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Staying in the same status is always allowed. Terminal states are final.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the worker's iteration loop, persisted in the state file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    #[default]
    Running,
    Completed,
    Blocked,
    Failed,
}

impl LoopStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Process exit code the worker reports for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Blocked => 2,
            Self::Running | Self::Failed => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
