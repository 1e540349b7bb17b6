//! Tool-access policy and the stop hook.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use taskbox_claude_sdk::HookDecision;
use tracing::{info, warn};

use crate::config::WorkerPaths;
use crate::signal::SignalFile;

/// Shell commands the agent may never run.
const DENY_BASH_PATTERNS: &[&str] = &[
    r"\brm\s+-rf\s+[/~.]",
    r"\bgit\s+push\s+.*--force\b",
    r"\bgit\s+reset\s+--hard\b",
    r"\bgit\s+clean\s+.*-f\b",
    r"\bnpm\s+publish\b",
    r"\bcurl\b.*\|\s*(sh|bash)\b",
];

/// File names the agent may never write, wherever they live.
const PROTECTED_NAMES: &[&str] = &[".env", ".npmrc"];

/// Consecutive stop blocks after which the stop is allowed anyway.
pub const MAX_CONSECUTIVE_STOP_BLOCKS: u32 = 5;

/// Message sent back to the agent when its stop is blocked.
pub fn stop_block_reason(paths: &WorkerPaths) -> String {
    let progress = workspace_relative(paths, &paths.progress_file);
    let signal = workspace_relative(paths, &paths.signal_file);
    format!(
        "Task is not complete. Check {progress} and continue working. \
When finished, write TASK_COMPLETE to {signal}. \
If stuck, write TASK_BLOCKED to {signal}."
    )
}

fn workspace_relative(paths: &WorkerPaths, path: &Path) -> String {
    path.strip_prefix(&paths.workspace)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Verdict of the tool policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Deny list applied to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    deny: Vec<Regex>,
    workspace: PathBuf,
    protected_paths: Vec<PathBuf>,
}

impl ToolPolicy {
    /// Policy for a worker laid out as `paths`; the worker's own state file
    /// is write-protected.
    pub fn new(paths: &WorkerPaths) -> Self {
        let deny = DENY_BASH_PATTERNS
            .iter()
            .filter_map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| warn!(pattern, error = %e, "Skipping invalid deny pattern"))
                    .ok()
            })
            .collect();
        Self {
            deny,
            workspace: paths.workspace.clone(),
            protected_paths: vec![paths.state_file.clone()],
        }
    }

    fn is_protected(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| PROTECTED_NAMES.contains(&name))
        {
            return true;
        }
        // Relative paths are resolved against the agent's working directory.
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        };
        let resolved = normalize(&resolved);
        self.protected_paths.iter().any(|p| normalize(p) == resolved)
    }

    pub fn check(&self, tool_name: &str, input: &Value) -> PolicyDecision {
        match tool_name {
            "Bash" => {
                let command = input.get("command").and_then(Value::as_str).unwrap_or("");
                if self.deny.iter().any(|re| re.is_match(command)) {
                    return PolicyDecision::Deny(format!("Blocked dangerous command: {}", command));
                }
            }
            "Write" | "Edit" | "MultiEdit" => {
                let path = input.get("file_path").and_then(Value::as_str).unwrap_or("");
                if !path.is_empty() && self.is_protected(path) {
                    return PolicyDecision::Deny(format!("Protected file: {}", path));
                }
            }
            _ => {}
        }
        PolicyDecision::Allow
    }
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Stop hook: keeps the agent working until it leaves a valid signal.
///
/// After [`MAX_CONSECUTIVE_STOP_BLOCKS`] blocks in a row the stop is let
/// through so the outer loop can re-evaluate.
#[derive(Debug)]
pub struct StopGuard {
    signal: SignalFile,
    reason: String,
    consecutive_blocks: AtomicU32,
}

impl StopGuard {
    pub fn new(paths: &WorkerPaths) -> Self {
        Self {
            signal: SignalFile::new(&paths.signal_file),
            reason: stop_block_reason(paths),
            consecutive_blocks: AtomicU32::new(0),
        }
    }

    /// Decide whether the agent may end its turn.
    ///
    /// `stop_hook_active` is set by the CLI when the agent is already
    /// continuing because of an earlier block.
    pub fn on_stop(&self, stop_hook_active: bool) -> HookDecision {
        if stop_hook_active {
            return HookDecision::Continue;
        }

        if let Some(signal) = self.signal.read() {
            info!(%signal, "Stop allowed, signal present");
            self.consecutive_blocks.store(0, Ordering::SeqCst);
            return HookDecision::Continue;
        }

        if self.consecutive_blocks.load(Ordering::SeqCst) >= MAX_CONSECUTIVE_STOP_BLOCKS {
            warn!("Stop hook circuit breaker tripped, allowing stop");
            self.consecutive_blocks.store(0, Ordering::SeqCst);
            return HookDecision::Continue;
        }

        self.consecutive_blocks.fetch_add(1, Ordering::SeqCst);
        HookDecision::Block {
            reason: self.reason.clone(),
        }
    }
}
