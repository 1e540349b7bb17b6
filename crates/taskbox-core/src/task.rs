//! Task types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CompletionCheck, CoreError, TaskId, TaskStatus};

/// Resource limits for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLimits {
    pub max_iterations: u32,
    pub max_hours: f64,
    pub max_budget_usd: f64,
    pub turns_per_iteration: u32,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_hours: 4.0,
            max_budget_usd: 30.0,
            turns_per_iteration: 30,
        }
    }
}

impl TaskLimits {
    /// Reject non-positive limits.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_iterations == 0 {
            return Err(CoreError::InvalidInput(
                "max_iterations must be positive".to_string(),
            ));
        }
        if self.turns_per_iteration == 0 {
            return Err(CoreError::InvalidInput(
                "turns_per_iteration must be positive".to_string(),
            ));
        }
        if !(self.max_hours.is_finite() && self.max_hours > 0.0) {
            return Err(CoreError::InvalidInput(
                "max_hours must be a positive number".to_string(),
            ));
        }
        if !(self.max_budget_usd.is_finite() && self.max_budget_usd > 0.0) {
            return Err(CoreError::InvalidInput(
                "max_budget_usd must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub prompt: String,
    pub project_dir: PathBuf,
    #[serde(default)]
    pub limits: TaskLimits,
    #[serde(default)]
    pub completion_checks: Vec<CompletionCheck>,
    /// Start every iteration with a fresh agent context.
    #[serde(default)]
    pub fresh_context: bool,
}

impl NewTask {
    pub fn new(prompt: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            project_dir: project_dir.into(),
            limits: TaskLimits::default(),
            completion_checks: Vec::new(),
            fresh_context: false,
        }
    }

    /// Builder method to set the limits.
    pub fn with_limits(mut self, limits: TaskLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builder method to add a completion check.
    pub fn with_check(mut self, check: CompletionCheck) -> Self {
        self.completion_checks.push(check);
        self
    }

    pub fn with_fresh_context(mut self, fresh_context: bool) -> Self {
        self.fresh_context = fresh_context;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::InvalidInput("prompt must not be empty".to_string()));
        }
        self.limits.validate()
    }
}

/// A Task is one user-submitted unit of autonomous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Prompt handed to the agent.
    pub prompt: String,

    /// Source repository the workspace is copied from.
    pub project_dir: PathBuf,

    /// Isolated workspace, assigned at provisioning.
    pub workspace_path: Option<PathBuf>,

    /// Current task status.
    pub status: TaskStatus,

    /// Container running the worker, once launched.
    pub container_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Worker process exit code.
    pub exit_code: Option<i64>,

    /// Accumulated agent cost; never decreases.
    pub cost_usd: f64,

    /// Latest iteration reported by the worker.
    pub iteration: u32,

    /// Host directory holding the event log and state file.
    pub log_dir: PathBuf,

    /// Human-readable failure summary.
    pub error: Option<String>,

    pub limits: TaskLimits,

    pub completion_checks: Vec<CompletionCheck>,

    #[serde(default)]
    pub fresh_context: bool,
}

impl Task {
    /// Create a pending task from its input.
    pub fn new(id: TaskId, input: NewTask, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            prompt: input.prompt,
            project_dir: input.project_dir,
            workspace_path: None,
            status: TaskStatus::Pending,
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            cost_usd: 0.0,
            iteration: 0,
            log_dir: log_dir.into(),
            error: None,
            limits: input.limits,
            completion_checks: input.completion_checks,
            fresh_context: input.fresh_context,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update of a task. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub workspace_path: Option<PathBuf>,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub cost_usd: Option<f64>,
    /// Spend to add to the stored cost, read and written in one update.
    pub cost_increment: Option<f64>,
    pub iteration: Option<u32>,
    pub error: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Move to a terminal status and stamp the finish time.
    pub fn finish(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_progress(mut self, iteration: u32, cost_usd: f64) -> Self {
        self.iteration = Some(iteration);
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Record an iteration and add its spend to the running total.
    pub fn with_iteration_cost(mut self, iteration: u32, cost_usd: f64) -> Self {
        self.iteration = Some(iteration);
        self.cost_increment = Some(cost_usd);
        self
    }

    /// Apply the patch, enforcing the status state machine and cost monotonicity.
    ///
    /// On error the task is left unchanged.
    pub fn apply(self, task: &mut Task) -> Result<(), CoreError> {
        if let Some(next) = self.status {
            if !task.status.can_transition_to(next) {
                return Err(CoreError::InvalidStateTransition {
                    from: task.status,
                    to: next,
                });
            }
            task.status = next;
        }
        if let Some(path) = self.workspace_path {
            task.workspace_path = Some(path);
        }
        if let Some(id) = self.container_id {
            task.container_id = Some(id);
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            task.finished_at = Some(at);
        }
        if let Some(code) = self.exit_code {
            task.exit_code = Some(code);
        }
        if let Some(cost) = self.cost_usd {
            if cost.is_finite() && cost > task.cost_usd {
                task.cost_usd = cost;
            }
        }
        if let Some(delta) = self.cost_increment {
            if delta.is_finite() && delta > 0.0 {
                task.cost_usd += delta;
            }
        }
        if let Some(iteration) = self.iteration {
            task.iteration = iteration;
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        Ok(())
    }
}
