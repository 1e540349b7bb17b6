//! Worker configuration.
//!
//! The host launches the container with the task's launch contract as
//! command-line flags; [`WorkerArgs`] parses them and [`WorkerArgs::into_config`]
//! validates them into a [`WorkerConfig`].

use std::path::{Path, PathBuf};

use clap::Parser;
use taskbox_core::{CompletionCheck, TaskLimits};

use crate::error::WorkerError;

/// Directory inside the workspace holding orchestration files.
pub const STATE_DIR: &str = ".orchestrator";

/// TaskBox worker - runs one task's agent loop.
#[derive(Parser, Debug, Clone)]
#[command(name = "taskbox-worker", about = "Run one TaskBox task inside its container")]
pub struct WorkerArgs {
    /// Task prompt
    #[arg(long, env = "TASKBOX_PROMPT")]
    pub prompt: Option<String>,

    /// Maximum agent iterations
    #[arg(long, default_value_t = 10)]
    pub max_iterations: u32,

    /// Maximum wall-clock hours
    #[arg(long, default_value_t = 4.0)]
    pub max_hours: f64,

    /// Maximum total spend in USD
    #[arg(long, default_value_t = 30.0)]
    pub max_budget: f64,

    /// Agent turns per iteration
    #[arg(long, default_value_t = 30)]
    pub turns_per_iteration: u32,

    /// Directory for the event log and state file
    #[arg(long, default_value = "/logs")]
    pub log_dir: PathBuf,

    /// Workspace root
    #[arg(long, default_value = "/workspace")]
    pub workspace: PathBuf,

    /// JSON array of completion checks
    #[arg(long, default_value = "")]
    pub completion_checks: String,

    /// Start every iteration with a fresh agent context
    #[arg(long)]
    pub fresh_context: bool,

    /// Path to the Claude CLI
    #[arg(long, default_value = "claude", env = "CLAUDE_PATH")]
    pub claude_path: String,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,
}

impl WorkerArgs {
    /// Validate the launch contract.
    pub fn into_config(self) -> Result<WorkerConfig, WorkerError> {
        let prompt = self
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| WorkerError::Config("a task prompt is required (--prompt)".into()))?;

        let checks = CompletionCheck::parse_list(&self.completion_checks).map_err(|e| {
            WorkerError::Config(format!("invalid --completion-checks JSON: {}", e))
        })?;

        let limits = TaskLimits {
            max_iterations: self.max_iterations,
            max_hours: self.max_hours,
            max_budget_usd: self.max_budget,
            turns_per_iteration: self.turns_per_iteration,
        };
        limits
            .validate()
            .map_err(|e| WorkerError::Config(e.to_string()))?;

        Ok(WorkerConfig {
            prompt,
            limits,
            checks,
            fresh_context: self.fresh_context,
            paths: WorkerPaths::new(self.workspace, self.log_dir),
            claude_path: self.claude_path,
            model: self.model,
        })
    }
}

/// Validated worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub prompt: String,
    pub limits: TaskLimits,
    pub checks: Vec<CompletionCheck>,
    pub fresh_context: bool,
    pub paths: WorkerPaths,
    pub claude_path: String,
    pub model: Option<String>,
}

/// Every file location the worker touches, derived once from the workspace
/// root and log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub events_file: PathBuf,
    pub signal_file: PathBuf,
    pub progress_file: PathBuf,
    mcp_config: PathBuf,
}

impl WorkerPaths {
    pub fn new(workspace: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let log_dir = log_dir.into();
        let state_dir = workspace.join(STATE_DIR);
        Self {
            state_file: log_dir.join("state.json"),
            events_file: log_dir.join("events.jsonl"),
            signal_file: state_dir.join("task-signal"),
            progress_file: state_dir.join("progress.md"),
            mcp_config: workspace.join(".mcp.orchestrator.json"),
            workspace,
            state_dir,
            log_dir,
        }
    }

    /// The MCP configuration file, if the workspace provides one.
    pub fn mcp_config(&self) -> Option<&Path> {
        self.mcp_config.is_file().then_some(self.mcp_config.as_path())
    }

    /// Create the state and log directories.
    pub fn ensure_dirs(&self) -> Result<(), WorkerError> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
