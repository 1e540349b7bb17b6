//! TaskBox Host Library
//!
//! Everything that runs outside the containers: configuration, the task
//! store, git workspaces, the container runtime adapter, the event tailer,
//! the per-task runner and the scheduler that bounds how many run at once.

pub mod config;
pub mod container;
pub mod events;
pub mod render;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod tailer;
pub mod taskfile;
pub mod workspace;

pub use config::{ConfigError, HostConfig, HostPaths};
pub use container::{ContainerError, ContainerRuntime, ContainerSpec, DockerCli};
pub use events::HostEvent;
pub use runner::{RunnerError, RunnerTiming, TaskRunner};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::{MemoryTaskStore, SqliteTaskStore, StoreError, TaskStore};
pub use tailer::{EventTailer, TailerError};
pub use taskfile::{TaskFile, TaskFileError};
pub use workspace::{GitWorkspaces, WorkspaceError, Workspaces};
