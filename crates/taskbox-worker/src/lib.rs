//! TaskBox worker.
//!
//! Runs inside a task's container and drives the agent through bounded
//! iterations until the task completes, blocks, or exhausts its limits.
//! Everything the host needs to know is written to the JSONL event log in
//! the mounted log directory.

pub mod agent;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod event_log;
pub mod orchestrator;
pub mod policy;
pub mod progress;
pub mod prompt;
pub mod signal;
pub mod state;

pub use agent::{Agent, AgentOutcome, AgentRequest, ClaudeAgent, ClaudeReviewer};
pub use completion::{CompletionReport, CompletionVerifier, Reviewer};
pub use config::{WorkerArgs, WorkerConfig, WorkerPaths};
pub use error::{AgentError, WorkerError};
pub use event_log::EventLog;
pub use orchestrator::{AbortHandle, IterationLoop};
