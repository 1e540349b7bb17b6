//! Ready-to-use `ControlHandler` implementations.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::trace;

use crate::error::SdkError;
use crate::protocol::ControlHandler;
use crate::types::{ClaudeMessage, PermissionResult};

/// Tools that cannot change the working tree.
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Grep", "Glob", "LS"];

/// A handler that only allows tools which cannot modify files.
///
/// Used for reviewer queries, where the agent may inspect the workspace
/// but must not touch it.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyHandler;

impl ReadOnlyHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn allows(tool_name: &str) -> bool {
        READ_ONLY_TOOLS.contains(&tool_name)
    }
}

#[async_trait]
impl ControlHandler for ReadOnlyHandler {
    async fn on_can_use_tool(
        &self,
        tool_name: String,
        input: Value,
    ) -> Result<PermissionResult, SdkError> {
        if Self::allows(&tool_name) {
            Ok(PermissionResult::allow(input))
        } else {
            trace!("Denying non read-only tool: {}", tool_name);
            Ok(PermissionResult::deny(format!(
                "{} is not available in read-only mode",
                tool_name
            )))
        }
    }

    async fn on_hook_callback(
        &self,
        _callback_id: String,
        _input: Value,
        _tool_use_id: Option<String>,
    ) -> Result<Value, SdkError> {
        Ok(json!({}))
    }

    async fn on_message(&self, message: ClaudeMessage) -> Result<(), SdkError> {
        trace!(message_type = message.kind(), "Read-only query message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_only_handler() {
        let handler = ReadOnlyHandler::new();

        let read = handler
            .on_can_use_tool("Read".to_string(), json!({"file_path": "src/lib.rs"}))
            .await
            .unwrap();
        assert!(read.is_allowed());

        for tool in ["Write", "Edit", "Bash"] {
            let result = handler
                .on_can_use_tool(tool.to_string(), json!({}))
                .await
                .unwrap();
            match result {
                PermissionResult::Deny { message, .. } => assert!(message.contains(tool)),
                _ => panic!("Expected Deny for {}", tool),
            }
        }
    }
}
