//! Error types for the Claude Code SDK.

use thiserror::Error;

/// Errors that can occur during Claude Code SDK operations.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Claude CLI executable not found.
    #[error("Claude CLI not found at '{0}'. Ensure Claude Code is installed.")]
    ClaudeNotFound(String),

    /// Failed to spawn or talk to the Claude process.
    #[error("Claude process I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Claude process exited with an error.
    #[error("Claude process exited with error: {0}")]
    ProcessError(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Protocol error during communication.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Channel send error.
    #[error("Channel closed")]
    ChannelClosed,

    /// The query was aborted through its cancellation token.
    #[error("Query aborted")]
    Aborted,
}

impl SdkError {
    /// True when the error came from an explicit abort rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
