//! Claude Code executor for running agents via subprocess.
//!
//! This module provides the main `ClaudeExecutor` type. Each query spawns one
//! CLI process speaking stream-json on both ends, so permission checks and
//! hook callbacks are answered by a [`ControlHandler`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SdkError;
use crate::protocol::{ControlHandler, ProtocolPeer};
use crate::types::{HookKind, PermissionMode};

/// How long the CLI gets to exit on its own after reporting a result.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum agent turns for this query.
    pub max_turns: Option<u32>,
    /// Spend cap for this query.
    pub max_budget_usd: Option<f64>,
    /// Session to resume.
    pub resume: Option<String>,
    /// Branch the resumed session into a new one.
    pub fork_session: bool,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// MCP server configuration file.
    pub mcp_config: Option<PathBuf>,
    /// Hooks to register; callbacks arrive at the handler.
    pub hooks: Vec<HookKind>,
    /// Tools the agent may use; empty means the CLI default.
    pub allowed_tools: Vec<String>,
}

/// Result of a Claude Code execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// The session ID from Claude Code.
    pub session_id: Option<String>,

    /// The model that was used for execution.
    pub model: Option<String>,

    /// Cost reported by the CLI for this query.
    pub cost_usd: f64,

    pub num_turns: u32,

    /// Duration of execution in milliseconds.
    pub duration_ms: u64,

    /// Whether the execution resulted in an error.
    pub is_error: bool,

    /// Result subtype (`success`, `error_max_turns`, ...).
    pub subtype: Option<String>,

    /// Final assistant text, if any.
    pub result_text: Option<String>,
}

/// Executor for Claude Code agents.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use taskbox_claude_sdk::{ClaudeExecutor, ReadOnlyHandler, QueryOptions};
/// use tokio_util::sync::CancellationToken;
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let executor = ClaudeExecutor::new("claude");
///     let result = executor
///         .query(
///             Path::new("."),
///             "Summarize the README",
///             &QueryOptions::default(),
///             Arc::new(ReadOnlyHandler::new()),
///             CancellationToken::new(),
///         )
///         .await?;
///
///     println!("{:?}", result.result_text);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    /// Path to the Claude CLI executable.
    claude_path: String,

    permission_mode: PermissionMode,

    model: Option<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,
}

impl ClaudeExecutor {
    /// Create a new executor with the given path to the Claude CLI.
    ///
    /// The path can be just "claude" to use PATH lookup, or a full path.
    pub fn new(claude_path: impl Into<String>) -> Self {
        Self {
            claude_path: claude_path.into(),
            permission_mode: PermissionMode::Default,
            model: None,
            env_vars: Vec::new(),
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// CLI arguments for one query.
    fn args(&self, options: &QueryOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("--permission-mode".to_string());
        args.push(self.permission_mode.to_string());

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(turns) = options.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        if let Some(budget) = options.max_budget_usd {
            args.push("--max-budget-usd".to_string());
            args.push(format!("{:.4}", budget));
        }
        if let Some(session) = &options.resume {
            args.push("--resume".to_string());
            args.push(session.clone());
            if options.fork_session {
                args.push("--fork-session".to_string());
            }
        }
        if let Some(append) = &options.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(append.clone());
        }
        if let Some(mcp) = &options.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp.display().to_string());
        }
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.allowed_tools.join(","));
        }
        args
    }

    /// Run one query to completion.
    ///
    /// Cancelling `cancel` kills the CLI and returns [`SdkError::Aborted`].
    pub async fn query(
        &self,
        working_dir: &Path,
        prompt: &str,
        options: &QueryOptions,
        handler: Arc<dyn ControlHandler>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SdkError> {
        let args = self.args(options);
        info!(
            claude_path = %self.claude_path,
            working_dir = %working_dir.display(),
            prompt_len = prompt.len(),
            resume = options.resume.is_some(),
            fork = options.fork_session,
            "Starting Claude query"
        );
        debug!(?args, "Claude arguments");

        let mut cmd = Command::new(&self.claude_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(working_dir)
            .kill_on_drop(true);
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn Claude process");
            if e.kind() == std::io::ErrorKind::NotFound {
                SdkError::ClaudeNotFound(self.claude_path.clone())
            } else {
                SdkError::Io(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stderr".to_string()))?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        warn!(stderr = %line.trim(), "Claude stderr");
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Error reading Claude stderr");
                        break;
                    }
                }
            }
        });

        let (peer, mut reader) = ProtocolPeer::spawn(stdin, stdout, handler);

        let hooks = (!options.hooks.is_empty()).then(|| HookKind::registration(&options.hooks));
        let started = async {
            peer.initialize(hooks).await?;
            peer.send_prompt(prompt).await
        };
        tokio::select! {
            _ = cancel.cancelled() => return abort(&mut child).await,
            sent = started => sent?,
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return abort(&mut child).await,
            joined = &mut reader => joined
                .map_err(|e| SdkError::ProtocolError(format!("read loop panicked: {}", e)))??,
        };

        // Closing stdin lets the CLI exit.
        drop(peer);

        let Some(summary) = outcome else {
            let status = child.wait().await?;
            return Err(SdkError::ProcessError(format!(
                "Claude exited without a result ({})",
                status
            )));
        };

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => debug!(status = ?status, "Claude process exited"),
            Err(_) => {
                debug!("Claude did not exit after result, killing");
                child.kill().await.ok();
            }
        }

        info!(
            session_id = ?summary.session_id,
            cost_usd = summary.total_cost_usd,
            num_turns = summary.num_turns,
            is_error = summary.is_error,
            "Claude query finished"
        );

        Ok(ExecutionResult {
            session_id: summary.session_id,
            model: summary.model.or_else(|| self.model.clone()),
            cost_usd: summary.total_cost_usd,
            num_turns: summary.num_turns,
            duration_ms: summary.duration_ms,
            is_error: summary.is_error,
            subtype: summary.subtype,
            result_text: summary.result,
        })
    }
}

async fn abort(child: &mut Child) -> Result<ExecutionResult, SdkError> {
    info!("Claude query aborted, killing process");
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill Claude process");
    }
    Err(SdkError::Aborted)
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ReadOnlyHandler;

    #[test]
    fn test_executor_builder() {
        let executor = ClaudeExecutor::new("claude")
            .with_model("claude-sonnet-4-20250514")
            .with_permission_mode(PermissionMode::BypassPermissions)
            .with_env("ANTHROPIC_API_KEY", "test-key");

        assert_eq!(executor.claude_path, "claude");
        assert_eq!(executor.model, Some("claude-sonnet-4-20250514".to_string()));
        assert_eq!(executor.permission_mode, PermissionMode::BypassPermissions);
        assert_eq!(executor.env_vars.len(), 1);
    }

    #[test]
    fn test_args_for_fresh_query() {
        let executor = ClaudeExecutor::default();
        let args = executor.args(&QueryOptions {
            max_turns: Some(30),
            max_budget_usd: Some(2.5),
            ..QueryOptions::default()
        });

        assert!(args.windows(2).any(|w| w == ["--max-turns", "30"]));
        assert!(args.windows(2).any(|w| w == ["--max-budget-usd", "2.5000"]));
        assert!(args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(!args.iter().any(|a| a == "--resume"));
        assert!(!args.iter().any(|a| a == "--fork-session"));
    }

    #[test]
    fn test_args_for_forked_resume() {
        let executor = ClaudeExecutor::default();
        let args = executor.args(&QueryOptions {
            resume: Some("sess-1".to_string()),
            fork_session: true,
            append_system_prompt: Some("be brief".to_string()),
            ..QueryOptions::default()
        });

        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
        assert!(args.iter().any(|a| a == "--fork-session"));
        assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "be brief"]));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let executor = ClaudeExecutor::new("/nonexistent/claude-binary");
        let err = executor
            .query(
                Path::new("."),
                "hi",
                &QueryOptions::default(),
                Arc::new(ReadOnlyHandler::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::ClaudeNotFound(_)));
    }
}
