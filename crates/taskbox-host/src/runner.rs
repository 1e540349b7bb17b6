//! Task runner - drives one task from workspace to cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskbox_core::{Task, TaskId, TaskPatch, TaskStatus, WorkerEvent};

use crate::container::{ContainerError, ContainerRuntime, ContainerSpec};
use crate::events::HostEvent;
use crate::store::{StoreError, TaskStore};
use crate::tailer::{EventTailer, TailItem};
use crate::workspace::{WorkspaceError, Workspaces};

/// Worker exit code for a blocked task.
const EXIT_BLOCKED: i64 = 2;

/// Error recorded on running tasks whose host went away.
pub const RECOVERED_ERROR: &str = "Process terminated unexpectedly (recovered on restart)";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Workspace provisioning failed: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Failed to prepare log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

/// Runner timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RunnerTiming {
    /// Event log poll interval.
    pub tail_interval: Duration,
    /// How long the tailer keeps reading after the container exits.
    pub drain_grace: Duration,
}

impl Default for RunnerTiming {
    fn default() -> Self {
        Self {
            tail_interval: Duration::from_millis(500),
            drain_grace: Duration::from_millis(1000),
        }
    }
}

/// Resources a run has acquired and must release.
#[derive(Default)]
struct Acquired {
    workspace: Option<PathBuf>,
    container: Option<String>,
}

/// Drives tasks through their lifecycle. One runner serves any number of
/// concurrent runs; each `run` call owns one task.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    workspaces: Arc<dyn Workspaces>,
    containers: Arc<dyn ContainerRuntime>,
    events: broadcast::Sender<HostEvent>,
    timing: RunnerTiming,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        workspaces: Arc<dyn Workspaces>,
        containers: Arc<dyn ContainerRuntime>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            store,
            workspaces,
            containers,
            events,
            timing: RunnerTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: RunnerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run the task to a terminal status and release everything it acquired.
    ///
    /// Cancelling `cancel` stops the container; a task that still exits
    /// successfully keeps its `completed` status. Returns the final record.
    pub async fn run(&self, id: &TaskId, cancel: CancellationToken) -> Option<Task> {
        let Some(task) = self.store.get(id).await else {
            warn!(task_id = %id, "Task vanished before it could run");
            return None;
        };
        info!(task_id = %id, project = %task.project_dir.display(), "Running task");

        let mut acquired = Acquired::default();
        if let Err(e) = self.execute(&task, &mut acquired, &cancel).await {
            let patch = if cancel.is_cancelled() {
                info!(task_id = %id, "Task cancelled");
                TaskPatch::finish(TaskStatus::Cancelled)
            } else {
                error!(task_id = %id, error = %e, "Task failed");
                TaskPatch::finish(TaskStatus::Failed).with_error(e.to_string())
            };
            self.update(id, patch).await;
        }

        self.cleanup(id, acquired).await;
        self.store.get(id).await
    }

    async fn execute(
        &self,
        task: &Task,
        acquired: &mut Acquired,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let id = &task.id;
        check(cancel)?;

        let workspace = self.workspaces.provision(&task.project_dir, id).await?;
        acquired.workspace = Some(workspace.clone());
        self.store
            .update(
                id,
                TaskPatch {
                    workspace_path: Some(workspace.clone()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        check(cancel)?;

        self.containers.ensure_image().await?;
        check(cancel)?;

        tokio::fs::create_dir_all(&task.log_dir).await?;
        let spec = ContainerSpec {
            task_id: id.clone(),
            prompt: task.prompt.clone(),
            limits: task.limits.clone(),
            completion_checks: task.completion_checks.clone(),
            fresh_context: task.fresh_context,
            workspace,
            log_dir: task.log_dir.clone(),
        };
        let container = self.containers.create(&spec).await?;
        acquired.container = Some(container.clone());

        let running = self
            .store
            .update(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    started_at: Some(Utc::now()),
                    container_id: Some(container.clone()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.notify(running);

        if let Err(e) = self.containers.inject_credentials(&container).await {
            warn!(task_id = %id, error = %e, "Failed to copy credentials into container");
        }
        check(cancel)?;

        // Tail before starting so no early event is missed.
        let (tx, rx) = mpsc::unbounded_channel();
        let stop_tailing = CancellationToken::new();
        let tailer = EventTailer::new(task.log_dir.join("events.jsonl")).spawn(
            self.timing.tail_interval,
            tx,
            stop_tailing.clone(),
        );
        let projector = tokio::spawn(project_events(
            id.clone(),
            rx,
            self.store.clone(),
            self.events.clone(),
        ));

        let exit = self.start_and_wait(id, &container, cancel).await;
        if exit.is_ok() {
            tokio::time::sleep(self.timing.drain_grace).await;
        }
        stop_tailing.cancel();
        if let Err(e) = tailer.await {
            warn!(task_id = %id, error = %e, "Tailer task failed");
        }
        if let Err(e) = projector.await {
            warn!(task_id = %id, error = %e, "Event projection task failed");
        }
        let code = exit?;

        // The worker's own verdict stands over a cancellation that raced it.
        let status = match code {
            0 => TaskStatus::Completed,
            EXIT_BLOCKED => TaskStatus::Blocked,
            _ if cancel.is_cancelled() => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        };
        info!(task_id = %id, exit_code = code, status = %status, "Worker exited");

        let mut patch = TaskPatch::finish(status).with_exit_code(code);
        if status == TaskStatus::Failed {
            patch = patch.with_error(format!("Worker exited with code {}", code));
        }
        self.update(id, patch).await;

        if let Some(branch) = self
            .workspaces
            .integrate(&task.project_dir, &spec.workspace, id)
            .await
        {
            let _ = self.events.send(HostEvent::BranchCreated {
                task_id: id.clone(),
                branch,
            });
        }
        Ok(())
    }

    async fn start_and_wait(
        &self,
        id: &TaskId,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<i64, RunnerError> {
        self.containers.start(container).await?;
        debug!(task_id = %id, container_id = %container, "Container started");

        tokio::select! {
            code = self.containers.wait(container) => Ok(code?),
            _ = cancel.cancelled() => {
                info!(task_id = %id, container_id = %container, "Stopping container");
                if let Err(e) = self.containers.stop(container).await {
                    warn!(task_id = %id, error = %e, "Failed to stop container");
                }
                Ok(self.containers.wait(container).await?)
            }
        }
    }

    /// Remove the container and workspace. Failures are logged, never raised.
    async fn cleanup(&self, id: &TaskId, acquired: Acquired) {
        if let Some(container) = acquired.container {
            if let Err(e) = self.containers.remove(&container).await {
                warn!(task_id = %id, container_id = %container, error = %e, "Failed to remove container");
            }
        }
        if let Some(workspace) = acquired.workspace {
            if let Err(e) = self.workspaces.release(&workspace).await {
                warn!(task_id = %id, error = %e, "Failed to release workspace");
            }
        }
        debug!(task_id = %id, "Task cleaned up");
    }

    /// Apply a terminal patch and notify. A rejected patch means the task
    /// already reached a terminal status, which stands.
    async fn update(&self, id: &TaskId, patch: TaskPatch) {
        match self.store.update(id, patch).await {
            Ok(task) => self.notify(task),
            Err(e) => warn!(task_id = %id, error = %e, "Task update rejected"),
        }
    }

    fn notify(&self, task: Task) {
        let _ = self.events.send(HostEvent::TaskUpdated(task));
    }
}

fn check(cancel: &CancellationToken) -> Result<(), RunnerError> {
    if cancel.is_cancelled() {
        Err(RunnerError::Cancelled)
    } else {
        Ok(())
    }
}

/// Forward tailed events upward and fold progress into the task record.
async fn project_events(
    task_id: TaskId,
    mut rx: mpsc::UnboundedReceiver<TailItem>,
    store: Arc<dyn TaskStore>,
    events: broadcast::Sender<HostEvent>,
) {
    while let Some(item) = rx.recv().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Event log read error");
                let _ = events.send(HostEvent::TailerError {
                    task_id: task_id.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let patch = match &event {
            WorkerEvent::IterationEnd {
                iteration,
                cost_usd,
                ..
            } => Some(TaskPatch::default().with_iteration_cost(*iteration, *cost_usd)),
            WorkerEvent::Done {
                iterations,
                total_cost_usd,
                ..
            } => Some(TaskPatch::default().with_progress(*iterations, *total_cost_usd)),
            _ => None,
        };

        let _ = events.send(HostEvent::Worker {
            task_id: task_id.clone(),
            event,
        });

        if let Some(patch) = patch {
            match store.update(&task_id, patch).await {
                Ok(task) => {
                    let _ = events.send(HostEvent::TaskUpdated(task));
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record progress"),
            }
        }
    }
}

/// Fail `running` tasks whose container is no longer running.
///
/// A host that dies mid-run leaves its tasks `running` forever. Tasks whose
/// container is still alive belong to another live host and are left alone.
/// Returns the number of tasks recovered.
pub async fn recover_interrupted(store: &dyn TaskStore, containers: &dyn ContainerRuntime) -> usize {
    let mut recovered = 0;
    for task in store.list(Some(TaskStatus::Running)).await {
        let alive = match &task.container_id {
            Some(container) => match containers.is_running(container).await {
                Ok(alive) => alive,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Could not inspect container, leaving task as is");
                    continue;
                }
            },
            None => false,
        };
        if alive {
            continue;
        }

        let patch = TaskPatch::finish(TaskStatus::Failed).with_error(RECOVERED_ERROR);
        match store.update(&task.id, patch).await {
            Ok(_) => {
                warn!(task_id = %task.id, "Recovered interrupted task");
                recovered += 1;
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover task"),
        }
    }
    recovered
}
