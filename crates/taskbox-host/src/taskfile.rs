//! Task definition files.
//!
//! A task file is TOML:
//!
//! ```toml
//! prompt = "Port the parser to the new AST"
//! project = "../service"
//! fresh_context = true
//!
//! [limits]
//! max_iterations = 20
//! max_budget_usd = 50.0
//!
//! [[checks]]
//! type = "command"
//! cmd = "cargo test"
//!
//! [[checks]]
//! type = "review"
//! prompt = "Public API is documented"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use taskbox_core::{CompletionCheck, NewTask, TaskLimits};

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("Failed to read task file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Task file {0} names no project and none was given")]
    NoProject(PathBuf),
}

/// Limit fields a task file may override; unset fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitOverrides {
    pub max_iterations: Option<u32>,
    pub max_hours: Option<f64>,
    pub max_budget_usd: Option<f64>,
    pub turns_per_iteration: Option<u32>,
}

impl LimitOverrides {
    pub fn apply(&self, limits: &mut TaskLimits) {
        if let Some(v) = self.max_iterations {
            limits.max_iterations = v;
        }
        if let Some(v) = self.max_hours {
            limits.max_hours = v;
        }
        if let Some(v) = self.max_budget_usd {
            limits.max_budget_usd = v;
        }
        if let Some(v) = self.turns_per_iteration {
            limits.turns_per_iteration = v;
        }
    }
}

/// A parsed task file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub prompt: String,

    /// Source repository; relative paths resolve against the file's directory.
    #[serde(default)]
    pub project: Option<PathBuf>,

    #[serde(default)]
    pub limits: LimitOverrides,

    #[serde(default)]
    pub checks: Vec<CompletionCheck>,

    /// Start every iteration with a fresh agent context.
    #[serde(default)]
    pub fresh_context: bool,
}

impl TaskFile {
    pub async fn load(path: &Path) -> Result<Self, TaskFileError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TaskFileError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut file: TaskFile = toml::from_str(&raw).map_err(|source| TaskFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(project) = file.project.take() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            file.project = Some(if project.is_absolute() {
                project
            } else {
                base.join(project)
            });
        }
        Ok(file)
    }

    /// Build the task input. `project` from the command line wins over the file.
    pub fn into_new_task(
        self,
        path: &Path,
        project: Option<PathBuf>,
    ) -> Result<NewTask, TaskFileError> {
        let project = project
            .or(self.project)
            .ok_or_else(|| TaskFileError::NoProject(path.to_path_buf()))?;

        let mut limits = TaskLimits::default();
        self.limits.apply(&mut limits);

        let mut task = NewTask::new(self.prompt, project)
            .with_limits(limits)
            .with_fresh_context(self.fresh_context);
        task.completion_checks = self.checks;
        Ok(task)
    }
}
