//! Type definitions for Claude Code control protocol messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Top-level message from Claude Code CLI stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeMessage {
    /// System message (`init`, `compact_boundary`, ...).
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },

    /// Assistant response message.
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// User message (tool results echoed back).
    User {
        message: UserMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Condensed description of a batch of tool calls.
    ToolUseSummary {
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Terminating message of a query.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default, alias = "isError")]
        is_error: Option<bool>,
        #[serde(default, alias = "durationMs")]
        duration_ms: Option<u64>,
        #[serde(default, alias = "numTurns")]
        num_turns: Option<u32>,
        #[serde(default, alias = "totalCostUsd")]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },

    /// Control request from CLI (needs response).
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },

    /// Acknowledgement of a request we sent.
    ControlResponse {
        #[serde(default)]
        response: Value,
    },

    /// Unknown message type (fallback).
    #[serde(untagged)]
    Unknown(Value),
}

impl ClaudeMessage {
    /// Extract session ID from any message type.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::ToolUseSummary { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::ControlRequest { .. } | Self::ControlResponse { .. } | Self::Unknown(_) => None,
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Assistant { .. } => "assistant",
            Self::User { .. } => "user",
            Self::ToolUseSummary { .. } => "tool_use_summary",
            Self::Result { .. } => "result",
            Self::ControlRequest { .. } => "control_request",
            Self::ControlResponse { .. } => "control_response",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Assistant message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// User message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Content item in a message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// Text content.
    Text { text: String },

    /// Thinking/reasoning content.
    Thinking { thinking: String },

    /// Tool use request.
    ToolUse {
        id: String,
        #[serde(flatten)]
        tool_data: ToolData,
    },

    /// Tool result.
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

/// Structured tool data for Claude tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "name", content = "input")]
pub enum ToolData {
    Read {
        #[serde(alias = "path")]
        file_path: String,
    },

    Write {
        #[serde(alias = "path")]
        file_path: String,
        content: String,
    },

    Edit {
        #[serde(alias = "path")]
        file_path: String,
        #[serde(default, alias = "old_str", skip_serializing_if = "Option::is_none")]
        old_string: Option<String>,
        #[serde(default, alias = "new_str", skip_serializing_if = "Option::is_none")]
        new_string: Option<String>,
    },

    Bash {
        #[serde(alias = "cmd")]
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    Grep {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    Glob {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Unknown tool (fallback).
    #[serde(untagged)]
    Unknown(HashMap<String, Value>),
}

impl ToolData {
    /// Get the tool name.
    pub fn name(&self) -> &str {
        match self {
            Self::Read { .. } => "Read",
            Self::Write { .. } => "Write",
            Self::Edit { .. } => "Edit",
            Self::Bash { .. } => "Bash",
            Self::Grep { .. } => "Grep",
            Self::Glob { .. } => "Glob",
            Self::Unknown(data) => data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
        }
    }

    /// The tool input as JSON.
    pub fn input(&self) -> Value {
        match self {
            Self::Unknown(data) => data.get("input").cloned().unwrap_or(Value::Null),
            other => serde_json::to_value(other)
                .ok()
                .and_then(|mut v| v.get_mut("input").map(Value::take))
                .unwrap_or(Value::Null),
        }
    }
}

/// Control request from CLI to SDK.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Permission check for tool use.
    CanUseTool {
        tool_name: String,
        input: Value,
    },

    /// Hook callback.
    HookCallback {
        callback_id: String,
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
}

/// Permission result for tool use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase")]
pub enum PermissionResult {
    /// Allow the tool use.
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },

    /// Deny the tool use.
    Deny {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

impl PermissionResult {
    pub fn allow(input: Value) -> Self {
        Self::Allow {
            updated_input: input,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Lifecycle hooks the SDK registers with the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// The agent is about to end its turn.
    Stop,
    /// The CLI is about to summarize (compact) the context.
    PreCompact,
}

impl HookKind {
    /// Event name used by the CLI.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Stop => "Stop",
            Self::PreCompact => "PreCompact",
        }
    }

    /// Callback id we register for this hook.
    pub fn callback_id(&self) -> &'static str {
        match self {
            Self::Stop => "taskbox_stop",
            Self::PreCompact => "taskbox_pre_compact",
        }
    }

    pub fn from_callback_id(id: &str) -> Option<Self> {
        [Self::Stop, Self::PreCompact]
            .into_iter()
            .find(|kind| kind.callback_id() == id)
    }

    /// Hook configuration sent with the `initialize` request.
    pub fn registration(kinds: &[HookKind]) -> Value {
        let mut hooks = serde_json::Map::new();
        for kind in kinds {
            hooks.insert(
                kind.event_name().to_string(),
                json!([{ "matcher": null, "hookCallbackIds": [kind.callback_id()] }]),
            );
        }
        Value::Object(hooks)
    }
}

/// Hook callback answer.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    /// Let the CLI proceed.
    Continue,
    /// Stop the CLI from proceeding; the reason is fed back to the agent.
    Block { reason: String },
}

impl HookDecision {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Continue => json!({}),
            Self::Block { reason } => json!({ "decision": "block", "reason": reason }),
        }
    }
}

/// Permission mode for Claude Code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Default mode - asks for permission.
    #[default]
    Default,
    /// Accept file edits automatically.
    AcceptEdits,
    /// Plan mode - requires approval to exit.
    Plan,
    /// Bypass all permissions (dangerous).
    BypassPermissions,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::AcceptEdits => write!(f, "acceptEdits"),
            Self::Plan => write!(f, "plan"),
            Self::BypassPermissions => write!(f, "bypassPermissions"),
        }
    }
}

/// Control request from SDK to CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SdkControlRequest {
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_id: String,
    pub request: SdkControlRequestType,
}

impl SdkControlRequest {
    pub fn new(request: SdkControlRequestType) -> Self {
        Self {
            message_type: "control_request".to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            request,
        }
    }
}

/// Types of SDK control requests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SdkControlRequestType {
    /// Initialize the control protocol.
    Initialize {
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },

    /// Set the permission mode.
    SetPermissionMode { mode: PermissionMode },

    /// Interrupt the running turn.
    Interrupt,
}

/// User turn written to the CLI's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct SdkUserMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: Value,
}

impl SdkUserMessage {
    pub fn text(prompt: &str) -> Self {
        Self {
            message_type: "user".to_string(),
            message: json!({ "role": "user", "content": prompt }),
        }
    }
}

/// Control response from SDK to CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub message_type: String,
    pub response: ControlResponseType,
}

impl ControlResponse {
    pub fn new(response: ControlResponseType) -> Self {
        Self {
            message_type: "control_response".to_string(),
            response,
        }
    }
}

/// Types of control responses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseType {
    /// Successful response.
    Success {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },

    /// Error response.
    Error {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_parsing() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4"}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();

        assert!(matches!(msg, ClaudeMessage::System { .. }));
        assert_eq!(msg.session_id(), Some("abc123"));
        assert_eq!(msg.kind(), "system");
    }

    #[test]
    fn test_assistant_tool_use_parsing() {
        let json = r#"{"type":"assistant","message":{"role":"assistant","content":[
            {"type":"text","text":"Let me look"},
            {"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls -la"}}
        ]},"session_id":"s1"}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();

        let ClaudeMessage::Assistant { message, .. } = msg else {
            panic!("Expected assistant message");
        };
        assert_eq!(message.content.len(), 2);
        let ContentItem::ToolUse { tool_data, .. } = &message.content[1] else {
            panic!("Expected tool use");
        };
        assert_eq!(tool_data.name(), "Bash");
        assert_eq!(tool_data.input()["command"], "ls -la");
    }

    #[test]
    fn test_result_message_parsing() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1234,
            "num_turns":7,"total_cost_usd":0.42,"result":"done","session_id":"sess-abc"}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();

        let ClaudeMessage::Result {
            subtype,
            num_turns,
            total_cost_usd,
            result,
            session_id,
            ..
        } = msg
        else {
            panic!("Expected result message");
        };
        assert_eq!(subtype.as_deref(), Some("success"));
        assert_eq!(num_turns, Some(7));
        assert_eq!(total_cost_usd, Some(0.42));
        assert_eq!(result.as_deref(), Some("done"));
        assert_eq!(session_id.as_deref(), Some("sess-abc"));
    }

    #[test]
    fn test_control_request_parsing() {
        let json = r#"{"type":"control_request","request_id":"req-123","request":{"subtype":"hook_callback","callback_id":"taskbox_stop","input":{"stop_hook_active":false}}}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();

        let ClaudeMessage::ControlRequest { request_id, request } = msg else {
            panic!("Expected control request");
        };
        assert_eq!(request_id, "req-123");
        let ControlRequest::HookCallback { callback_id, .. } = request else {
            panic!("Expected hook callback");
        };
        assert_eq!(HookKind::from_callback_id(&callback_id), Some(HookKind::Stop));
    }

    #[test]
    fn test_unknown_message_falls_back() {
        let msg: ClaudeMessage = serde_json::from_str(r#"{"type":"stream_event","x":1}"#).unwrap();
        assert!(matches!(msg, ClaudeMessage::Unknown(_)));
    }

    #[test]
    fn test_hook_registration_and_decisions() {
        let hooks = HookKind::registration(&[HookKind::Stop, HookKind::PreCompact]);
        assert_eq!(hooks["Stop"][0]["hookCallbackIds"][0], "taskbox_stop");
        assert_eq!(hooks["PreCompact"][0]["hookCallbackIds"][0], "taskbox_pre_compact");

        assert_eq!(HookDecision::Continue.to_value(), json!({}));
        let block = HookDecision::Block {
            reason: "keep going".to_string(),
        };
        assert_eq!(block.to_value()["decision"], "block");
    }

    #[test]
    fn test_permission_result_serialization() {
        let deny = serde_json::to_value(PermissionResult::deny("nope")).unwrap();
        assert_eq!(deny["behavior"], "deny");
        assert_eq!(deny["message"], "nope");

        let allow = serde_json::to_value(PermissionResult::allow(json!({"a": 1}))).unwrap();
        assert_eq!(allow["behavior"], "allow");
        assert_eq!(allow["updatedInput"]["a"], 1);
    }

    #[test]
    fn test_permission_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::BypassPermissions).unwrap(),
            r#""bypassPermissions""#
        );
    }
}
