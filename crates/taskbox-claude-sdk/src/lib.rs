//! Claude Code SDK for TaskBox
//!
//! Runs Claude Code as a subprocess and speaks its stream-json control
//! protocol: tool permission checks and lifecycle hooks are answered by a
//! [`ControlHandler`], and each query reports its session, cost and turn
//! count so callers can resume, fork or budget follow-up queries.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use taskbox_claude_sdk::{ClaudeExecutor, PermissionMode, QueryOptions, ReadOnlyHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run_agent() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = ClaudeExecutor::new("claude")
//!         .with_permission_mode(PermissionMode::BypassPermissions);
//!
//!     let options = QueryOptions {
//!         max_turns: Some(5),
//!         ..QueryOptions::default()
//!     };
//!     let result = executor
//!         .query(
//!             Path::new("."),
//!             "What is 2 + 2?",
//!             &options,
//!             Arc::new(ReadOnlyHandler::new()),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!
//!     println!("Session ID: {:?}", result.session_id);
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod executor;
mod protocol;
mod types;

pub use client::{ReadOnlyHandler, READ_ONLY_TOOLS};
pub use error::SdkError;
pub use executor::{ClaudeExecutor, ExecutionResult, QueryOptions};
pub use protocol::{ControlHandler, ProtocolPeer, ResultSummary};
pub use types::{
    AssistantMessage, ClaudeMessage, ContentItem, ControlRequest, ControlResponse,
    ControlResponseType, HookDecision, HookKind, PermissionMode, PermissionResult,
    SdkControlRequest, SdkControlRequestType, SdkUserMessage, ToolData, UserMessage,
};
