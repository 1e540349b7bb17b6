//! The agent seam and its Claude Code implementation.
//!
//! The iteration loop only knows [`Agent`]: one bounded invocation that
//! streams worker events and reports session, cost and turn count.
//! [`ClaudeAgent`] drives the Claude Code CLI through `taskbox-claude-sdk`,
//! answering permission checks with the [`ToolPolicy`] and the stop and
//! pre-compact hooks with the [`StopGuard`] and a compaction counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskbox_claude_sdk::{
    ClaudeExecutor, ClaudeMessage, ContentItem, ControlHandler, HookKind, PermissionResult,
    QueryOptions, ReadOnlyHandler, SdkError, READ_ONLY_TOOLS,
};
use taskbox_core::{MessageSource, WorkerEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::Reviewer;
use crate::error::AgentError;
use crate::event_log::EventLog;
use crate::policy::{PolicyDecision, StopGuard, ToolPolicy};
use crate::prompt::REVIEWER_SYSTEM_PROMPT;
use crate::config::WorkerPaths;

const AGENT_TEXT_CHARS: usize = 200;
const TOOL_INPUT_CHARS: usize = 120;
const RESULT_TEXT_CHARS: usize = 500;

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub prompt: String,
    /// Session to resume; `None` starts a fresh context.
    pub resume: Option<String>,
    pub fork_session: bool,
    pub max_turns: u32,
    /// Spend cap for this invocation.
    pub max_budget_usd: f64,
    pub append_system_prompt: String,
    pub mcp_config: Option<PathBuf>,
}

/// What a completed invocation reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub num_turns: u32,
    /// Context compactions observed during the invocation.
    pub compactions: u32,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one invocation, emitting a worker event per meaningful message.
    ///
    /// Cancelling `cancel` must end the invocation with [`AgentError::Aborted`].
    async fn invoke(
        &self,
        request: AgentRequest,
        events: &EventLog,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError>;
}

/// Map an agent message to worker events.
pub fn project(message: &ClaudeMessage) -> Vec<WorkerEvent> {
    match message {
        ClaudeMessage::Assistant { message, .. } => message
            .content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(WorkerEvent::message(
                    MessageSource::Agent,
                    truncate(text, AGENT_TEXT_CHARS).replace('\n', " "),
                )),
                ContentItem::ToolUse { tool_data, .. } => {
                    let input = serde_json::to_string(&tool_data.input()).unwrap_or_default();
                    Some(WorkerEvent::message(
                        MessageSource::Tool,
                        format!("{}: {}", tool_data.name(), truncate(&input, TOOL_INPUT_CHARS)),
                    ))
                }
                _ => None,
            })
            .collect(),
        ClaudeMessage::System {
            subtype: Some(subtype),
            model,
            ..
        } if subtype == "init" => vec![WorkerEvent::system(format!(
            "Init: model={}",
            model.as_deref().unwrap_or("unknown")
        ))],
        ClaudeMessage::Result {
            subtype,
            num_turns,
            total_cost_usd,
            result,
            ..
        } => {
            let cost = total_cost_usd
                .map(|c| format!("${:.2}", c))
                .unwrap_or_else(|| "$?".to_string());
            let mut events = vec![WorkerEvent::system(format!(
                "Result: {} turns, {}, subtype={}",
                num_turns.unwrap_or(0),
                cost,
                subtype.as_deref().unwrap_or("ok")
            ))];
            if let Some(text) = result.as_deref().filter(|t| !t.is_empty()) {
                events.push(WorkerEvent::system(format!(
                    "Result text: {}",
                    truncate(text, RESULT_TEXT_CHARS)
                )));
            }
            events
        }
        ClaudeMessage::ToolUseSummary {
            summary: Some(summary),
            ..
        } if !summary.is_empty() => vec![WorkerEvent::message(
            MessageSource::Tool,
            truncate(summary, AGENT_TEXT_CHARS),
        )],
        _ => Vec::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Control handler for one loop invocation.
struct LoopHandler {
    policy: Arc<ToolPolicy>,
    stop_guard: StopGuard,
    compactions: AtomicU32,
    events: EventLog,
}

#[async_trait]
impl ControlHandler for LoopHandler {
    async fn on_can_use_tool(
        &self,
        tool_name: String,
        input: Value,
    ) -> Result<PermissionResult, SdkError> {
        match self.policy.check(&tool_name, &input) {
            PolicyDecision::Allow => Ok(PermissionResult::allow(input)),
            PolicyDecision::Deny(reason) => {
                warn!(tool = %tool_name, %reason, "Tool use denied");
                self.events.emit(WorkerEvent::system(format!("Denied: {}", reason)));
                Ok(PermissionResult::deny(reason))
            }
        }
    }

    async fn on_hook_callback(
        &self,
        callback_id: String,
        input: Value,
        _tool_use_id: Option<String>,
    ) -> Result<Value, SdkError> {
        match HookKind::from_callback_id(&callback_id) {
            Some(HookKind::Stop) => {
                let active = input
                    .get("stop_hook_active")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(self.stop_guard.on_stop(active).to_value())
            }
            Some(HookKind::PreCompact) => {
                let count = self.compactions.fetch_add(1, Ordering::SeqCst) + 1;
                info!(compactions = count, "Context compaction");
                Ok(json!({}))
            }
            None => {
                debug!(callback = %callback_id, "Unknown hook callback");
                Ok(json!({}))
            }
        }
    }

    async fn on_message(&self, message: ClaudeMessage) -> Result<(), SdkError> {
        for event in project(&message) {
            self.events.emit(event);
        }
        Ok(())
    }
}

/// [`Agent`] backed by the Claude Code CLI.
pub struct ClaudeAgent {
    executor: ClaudeExecutor,
    paths: WorkerPaths,
    policy: Arc<ToolPolicy>,
}

impl ClaudeAgent {
    pub fn new(executor: ClaudeExecutor, paths: &WorkerPaths) -> Self {
        Self {
            executor,
            policy: Arc::new(ToolPolicy::new(paths)),
            paths: paths.clone(),
        }
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    async fn invoke(
        &self,
        request: AgentRequest,
        events: &EventLog,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let handler = Arc::new(LoopHandler {
            policy: Arc::clone(&self.policy),
            stop_guard: StopGuard::new(&self.paths),
            compactions: AtomicU32::new(0),
            events: events.clone(),
        });

        let options = QueryOptions {
            max_turns: Some(request.max_turns),
            max_budget_usd: Some(request.max_budget_usd),
            resume: request.resume,
            fork_session: request.fork_session,
            append_system_prompt: Some(request.append_system_prompt),
            mcp_config: request.mcp_config,
            hooks: vec![HookKind::Stop, HookKind::PreCompact],
            allowed_tools: Vec::new(),
        };

        let result = self
            .executor
            .query(
                &self.paths.workspace,
                &request.prompt,
                &options,
                handler.clone(),
                cancel,
            )
            .await?;

        if result.is_error {
            warn!(subtype = ?result.subtype, "Agent reported an error result");
        }

        Ok(AgentOutcome {
            session_id: result.session_id,
            cost_usd: result.cost_usd,
            num_turns: result.num_turns,
            compactions: handler.compactions.load(Ordering::SeqCst),
        })
    }
}

/// [`Reviewer`] that runs a read-only Claude query.
pub struct ClaudeReviewer {
    executor: ClaudeExecutor,
}

impl ClaudeReviewer {
    pub fn new(executor: ClaudeExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Reviewer for ClaudeReviewer {
    async fn review(&self, workspace: &Path, prompt: &str) -> Result<String, AgentError> {
        let options = QueryOptions {
            append_system_prompt: Some(REVIEWER_SYSTEM_PROMPT.to_string()),
            allowed_tools: READ_ONLY_TOOLS.iter().map(|t| t.to_string()).collect(),
            ..QueryOptions::default()
        };
        let result = self
            .executor
            .query(
                workspace,
                prompt,
                &options,
                Arc::new(ReadOnlyHandler::new()),
                CancellationToken::new(),
            )
            .await?;

        match result.result_text {
            Some(text) if !result.is_error => Ok(text),
            Some(text) => Err(AgentError::Failed(text)),
            None => Err(AgentError::Failed(format!(
                "reviewer returned no result ({})",
                result.subtype.as_deref().unwrap_or("unknown")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ClaudeMessage {
        serde_json::from_str(json).unwrap()
    }

    fn texts(events: &[WorkerEvent]) -> Vec<(MessageSource, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Message { source, text } => Some((*source, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_project_assistant_text_and_tools() {
        let long = "x".repeat(300);
        let message = parse(&format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","content":[
                {{"type":"text","text":"line one\nline two"}},
                {{"type":"text","text":"{}"}},
                {{"type":"tool_use","id":"t1","name":"Bash","input":{{"command":"cargo test"}}}}
            ]}}}}"#,
            long
        ));

        let projected = texts(&project(&message));
        assert_eq!(projected.len(), 3);
        assert_eq!(projected[0], (MessageSource::Agent, "line one line two".to_string()));
        assert_eq!(projected[1].1.chars().count(), 200);
        assert_eq!(
            projected[2],
            (MessageSource::Tool, r#"Bash: {"command":"cargo test"}"#.to_string())
        );
    }

    #[test]
    fn test_project_system_and_result() {
        let init = parse(r#"{"type":"system","subtype":"init","session_id":"s","model":"opus"}"#);
        assert_eq!(
            texts(&project(&init)),
            vec![(MessageSource::System, "Init: model=opus".to_string())]
        );

        let result = parse(
            r#"{"type":"result","subtype":"success","num_turns":4,"total_cost_usd":1.234,"result":"All done"}"#,
        );
        assert_eq!(
            texts(&project(&result)),
            vec![
                (MessageSource::System, "Result: 4 turns, $1.23, subtype=success".to_string()),
                (MessageSource::System, "Result text: All done".to_string()),
            ]
        );

        let other = parse(r#"{"type":"system","subtype":"compact_boundary"}"#);
        assert!(project(&other).is_empty());
    }

    #[tokio::test]
    async fn test_loop_handler_applies_policy_and_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventLog::open(dir.path().join("events.jsonl")).unwrap();
        let paths = WorkerPaths::new(dir.path(), dir.path().join("logs"));
        let handler = LoopHandler {
            policy: Arc::new(ToolPolicy::new(&paths)),
            stop_guard: StopGuard::new(&paths),
            compactions: AtomicU32::new(0),
            events: events.clone(),
        };

        let denied = handler
            .on_can_use_tool("Bash".to_string(), json!({"command": "git reset --hard"}))
            .await
            .unwrap();
        assert!(!denied.is_allowed());
        let allowed = handler
            .on_can_use_tool("Bash".to_string(), json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(allowed.is_allowed());

        let stop = handler
            .on_hook_callback(
                HookKind::Stop.callback_id().to_string(),
                json!({"stop_hook_active": false}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(stop["decision"], "block");

        for _ in 0..2 {
            handler
                .on_hook_callback(HookKind::PreCompact.callback_id().to_string(), json!({}), None)
                .await
                .unwrap();
        }
        assert_eq!(handler.compactions.load(Ordering::SeqCst), 2);

        let logged = EventLog::read_all(events.path()).unwrap();
        assert_eq!(logged.len(), 1);
        assert!(matches!(
            &logged[0].event,
            WorkerEvent::Message { source: MessageSource::System, text } if text.starts_with("Denied:")
        ));
    }
}
