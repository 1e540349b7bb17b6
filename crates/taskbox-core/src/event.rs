//! Worker events written to the per-task event log.
//!
//! The worker appends one [`EventRecord`] per line (JSONL); the host tails the
//! file and folds the events into the task record. Events are immutable once
//! written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::LoopStatus;

/// Origin of a [`WorkerEvent::Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Text produced by the agent.
    Agent,
    /// A tool invocation by the agent.
    Tool,
    /// Orchestration bookkeeping.
    System,
}

/// An event emitted by the worker's iteration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// An iteration is about to invoke the agent.
    #[serde(rename = "iteration:start", rename_all = "camelCase")]
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        fresh: bool,
    },

    /// An iteration finished (successfully or aborted).
    #[serde(rename = "iteration:end", rename_all = "camelCase")]
    IterationEnd {
        iteration: u32,
        cost_usd: f64,
        duration_ms: u64,
        num_turns: u32,
    },

    /// Agent, tool or system message.
    #[serde(rename = "message")]
    Message { source: MessageSource, text: String },

    /// An agent invocation failed; `backoff_ms` is the delay before the retry.
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        iteration: u32,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff_ms: Option<u64>,
    },

    /// The agent wrote a recognized value to the signal file.
    #[serde(rename = "signal")]
    Signal { signal: String },

    /// Result of running the completion checks.
    #[serde(rename = "completion", rename_all = "camelCase")]
    Completion { all_passed: bool, summary: String },

    /// The progress artifact stopped changing.
    #[serde(rename = "stagnation", rename_all = "camelCase")]
    Stagnation { stagnant_count: u32, threshold: u32 },

    /// The wall-clock deadline passed.
    #[serde(rename = "timeout")]
    Timeout,

    /// Final summary; emitted exactly once per worker process.
    #[serde(rename = "done", rename_all = "camelCase")]
    Done {
        status: LoopStatus,
        iterations: u32,
        total_cost_usd: f64,
    },
}

impl WorkerEvent {
    pub fn message(source: MessageSource, text: impl Into<String>) -> Self {
        Self::Message {
            source,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::message(MessageSource::System, text)
    }

    /// The wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iteration:start",
            Self::IterationEnd { .. } => "iteration:end",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Signal { .. } => "signal",
            Self::Completion { .. } => "completion",
            Self::Stagnation { .. } => "stagnation",
            Self::Timeout => "timeout",
            Self::Done { .. } => "done",
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(alias = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: WorkerEvent,
}

impl EventRecord {
    /// Stamp an event with the current time.
    pub fn now(event: WorkerEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Serialize as a single newline-terminated JSONL line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
