//! Notifications published by the scheduler.

use taskbox_core::{Task, TaskId, WorkerEvent};
use tokio::sync::broadcast;

/// Capacity of the notification channel; slow subscribers lose the oldest messages.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something observable happened to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A worker event read from the task's event log.
    Worker { task_id: TaskId, event: WorkerEvent },

    /// The task record changed.
    TaskUpdated(Task),

    /// A line in the task's event log could not be read.
    TailerError { task_id: TaskId, message: String },

    /// Task results were integrated as a branch of the source repository.
    BranchCreated { task_id: TaskId, branch: String },
}

impl HostEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Worker { task_id, .. }
            | Self::TailerError { task_id, .. }
            | Self::BranchCreated { task_id, .. } => task_id,
            Self::TaskUpdated(task) => &task.id,
        }
    }
}

pub fn channel() -> broadcast::Sender<HostEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
