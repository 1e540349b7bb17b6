//! TaskBox Core Domain Types
//!
//! This crate contains pure domain types shared by the host (scheduler,
//! runner) and the worker that runs inside each container. It has no
//! dependencies on:
//! - Container runtimes
//! - Git or the filesystem
//! - The agent API
//!
//! Everything that crosses the host/container boundary (event records, the
//! completion-check list, the iteration state file) is defined here so both
//! sides agree on the wire format.

pub mod check;
pub mod error;
pub mod event;
pub mod ids;
pub mod signal;
pub mod state;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use check::CompletionCheck;
pub use error::CoreError;
pub use event::{EventRecord, MessageSource, WorkerEvent};
pub use ids::TaskId;
pub use signal::TaskSignal;
pub use state::{IterationError, IterationState};
pub use status::{LoopStatus, TaskStatus};
pub use task::{NewTask, Task, TaskLimits, TaskPatch};
