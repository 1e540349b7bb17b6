//! Worker error types.

use taskbox_core::CoreError;
use thiserror::Error;

/// Errors that end the worker before or outside the iteration loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid launch arguments.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Failure of a single agent invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// The invocation was interrupted by a user or system abort.
    #[error("Agent invocation aborted")]
    Aborted,

    /// The invocation failed; the loop retries with a fresh context.
    #[error("{0}")]
    Failed(String),
}

impl From<taskbox_claude_sdk::SdkError> for AgentError {
    fn from(err: taskbox_claude_sdk::SdkError) -> Self {
        if err.is_abort() {
            Self::Aborted
        } else {
            Self::Failed(err.to_string())
        }
    }
}
