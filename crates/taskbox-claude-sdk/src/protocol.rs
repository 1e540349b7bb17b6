//! Control protocol handling for Claude Code communication.
//!
//! This module implements the bidirectional JSON protocol for communicating
//! with the Claude Code CLI over stdin/stdout.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SdkError;
use crate::types::{
    ClaudeMessage, ControlRequest, ControlResponse, ControlResponseType, PermissionResult,
    SdkControlRequest, SdkControlRequestType, SdkUserMessage,
};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Handler trait for control protocol callbacks.
///
/// Implement this trait to customize how your application responds to
/// tool use permission requests and hook callbacks from Claude Code.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Called when Claude wants to use a tool.
    async fn on_can_use_tool(
        &self,
        tool_name: String,
        input: Value,
    ) -> Result<PermissionResult, SdkError>;

    /// Called for hook callbacks registered at initialization.
    async fn on_hook_callback(
        &self,
        callback_id: String,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<Value, SdkError>;

    /// Called for every non-control message, in arrival order.
    async fn on_message(&self, message: ClaudeMessage) -> Result<(), SdkError>;
}

/// What the read loop learned by the time the CLI reported its result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSummary {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub subtype: Option<String>,
    pub is_error: bool,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub result: Option<String>,
}

/// Protocol peer for bidirectional communication with Claude Code.
///
/// Manages the stdin/stdout streams and handles the control protocol
/// message exchange.
pub struct ProtocolPeer {
    stdin: Arc<Mutex<Writer>>,
}

impl ProtocolPeer {
    /// Spawn a new protocol peer and start the read loop.
    ///
    /// The returned handle resolves once the CLI emits its `result` message
    /// (`Some`) or closes stdout without one (`None`).
    pub fn spawn<R, W>(
        stdin: W,
        stdout: R,
        handler: Arc<dyn ControlHandler>,
    ) -> (Self, JoinHandle<Result<Option<ResultSummary>, SdkError>>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stdin: Arc<Mutex<Writer>> = Arc::new(Mutex::new(Box::new(stdin)));
        let stdin_clone = Arc::clone(&stdin);

        let reader = tokio::spawn(async move {
            debug!("Protocol read loop started");
            let outcome = Self::read_loop(stdout, handler, stdin_clone).await;
            debug!(ok = outcome.is_ok(), "Protocol read loop ended");
            outcome
        });

        (Self { stdin }, reader)
    }

    /// Initialize the control protocol, registering hook callbacks.
    ///
    /// This should be called once after spawning before sending any other messages.
    pub async fn initialize(&self, hooks: Option<Value>) -> Result<(), SdkError> {
        let request = SdkControlRequest::new(SdkControlRequestType::Initialize { hooks });
        self.send_json(&request).await?;
        debug!("Control protocol initialized");
        Ok(())
    }

    /// Send the user turn that starts the query.
    pub async fn send_prompt(&self, prompt: &str) -> Result<(), SdkError> {
        self.send_json(&SdkUserMessage::text(prompt)).await
    }

    /// Ask the CLI to stop the current turn.
    pub async fn interrupt(&self) -> Result<(), SdkError> {
        let request = SdkControlRequest::new(SdkControlRequestType::Interrupt);
        self.send_json(&request).await
    }

    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), SdkError> {
        let json = serde_json::to_string(message)?;
        trace!("Sending to stdin: {}", json);
        Self::write_line(&self.stdin, &json).await
    }

    async fn write_line(stdin: &Arc<Mutex<Writer>>, json: &str) -> Result<(), SdkError> {
        let mut stdin = stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Main read loop for processing stdout messages.
    async fn read_loop<R>(
        stdout: R,
        handler: Arc<dyn ControlHandler>,
        stdin: Arc<Mutex<Writer>>,
    ) -> Result<Option<ResultSummary>, SdkError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let mut message_count = 0u64;
        let mut summary = ResultSummary::default();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                info!(total_messages = message_count, "Claude stdout closed before result");
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            message_count += 1;
            trace!("Raw stdout: {}", trimmed);

            let message = match serde_json::from_str::<ClaudeMessage>(trimmed) {
                Ok(message) => message,
                Err(e) => {
                    let preview: String = trimmed.chars().take(200).collect();
                    warn!(error = %e, preview = %preview, "Failed to parse Claude message");
                    continue;
                }
            };
            debug!(message_type = message.kind(), "Parsed Claude message");

            if let Some(session_id) = message.session_id() {
                summary.session_id = Some(session_id.to_string());
            }

            match message {
                ClaudeMessage::ControlRequest {
                    request_id,
                    request,
                } => {
                    Self::handle_control_request(request_id, request, &handler, &stdin).await?;
                }
                ClaudeMessage::ControlResponse { response } => {
                    trace!(?response, "Control response");
                }
                ClaudeMessage::Result {
                    ref subtype,
                    is_error,
                    duration_ms,
                    num_turns,
                    total_cost_usd,
                    ref result,
                    ..
                } => {
                    summary.subtype = subtype.clone();
                    summary.is_error = is_error.unwrap_or(false);
                    summary.duration_ms = duration_ms.unwrap_or(0);
                    summary.num_turns = num_turns.unwrap_or(0);
                    summary.total_cost_usd = total_cost_usd.unwrap_or(0.0);
                    summary.result = result.clone();
                    if let Err(e) = handler.on_message(message).await {
                        warn!("Handler error processing result: {}", e);
                    }
                    return Ok(Some(summary));
                }
                other => {
                    if let ClaudeMessage::System {
                        model: Some(model), ..
                    } = &other
                    {
                        summary.model = Some(model.clone());
                    }
                    if let Err(e) = handler.on_message(other).await {
                        warn!("Handler error processing message: {}", e);
                    }
                }
            }
        }
    }

    /// Handle a control request from Claude Code.
    async fn handle_control_request(
        request_id: String,
        request: ControlRequest,
        handler: &Arc<dyn ControlHandler>,
        stdin: &Arc<Mutex<Writer>>,
    ) -> Result<(), SdkError> {
        debug!(request_id = %request_id, "Handling control request: {:?}", request);

        let outcome = match request {
            ControlRequest::CanUseTool { tool_name, input } => handler
                .on_can_use_tool(tool_name, input)
                .await
                .and_then(|result| Ok(serde_json::to_value(result)?)),
            ControlRequest::HookCallback {
                callback_id,
                input,
                tool_use_id,
            } => handler.on_hook_callback(callback_id, input, tool_use_id).await,
        };

        let response = match outcome {
            Ok(value) => ControlResponse::new(ControlResponseType::Success {
                request_id,
                response: Some(value),
            }),
            Err(e) => ControlResponse::new(ControlResponseType::Error {
                request_id,
                error: Some(e.to_string()),
            }),
        };

        let json = serde_json::to_string(&response)?;
        trace!("Sending control response: {}", json);
        Self::write_line(stdin, &json).await
    }
}
