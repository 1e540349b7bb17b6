//! Task scheduler - admits queued tasks into a bounded set of runners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbox_core::{NewTask, Task, TaskId, TaskPatch, TaskStatus};

use crate::events::HostEvent;
use crate::runner::TaskRunner;
use crate::store::{StoreError, TaskStore};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A runner currently owning a task.
struct ActiveRun {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    runner: Arc<TaskRunner>,
    max_concurrent: usize,
    shutdown_grace: Duration,
    active: Mutex<HashMap<TaskId, ActiveRun>>,
    events: broadcast::Sender<HostEvent>,
    started: AtomicBool,
    stopping: AtomicBool,
    ticking: AtomicBool,
    retick: AtomicBool,
    stopped: CancellationToken,
}

/// Task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a new Scheduler. `events` must be the channel the runner publishes to.
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<TaskRunner>,
        events: broadcast::Sender<HostEvent>,
        max_concurrent: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                max_concurrent: max_concurrent.max(1),
                shutdown_grace,
                active: Mutex::new(HashMap::new()),
                events,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                ticking: AtomicBool::new(false),
                retick: AtomicBool::new(false),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// Number of tasks currently owned by a runner.
    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Resolves once a termination signal has been handled by [`Scheduler::shutdown`].
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Persist a new pending task and try to admit it.
    pub async fn enqueue(&self, input: NewTask) -> Result<Task, SchedulerError> {
        let task = self.inner.store.create(input).await?;
        info!(task_id = %task.id, "Task enqueued");
        self.notify(task.clone());
        self.tick().await;
        Ok(task)
    }

    /// Cancel a task.
    ///
    /// A pending task is cancelled immediately. A running task has its
    /// runner signalled; the runner stops the container and records the
    /// outcome. Returns whether anything was cancelled.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        if let Some(run) = self.active().get(id) {
            info!(task_id = %id, "Cancelling running task");
            run.cancel.cancel();
            return Ok(true);
        }

        let task = self
            .inner
            .store
            .get(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        if task.status != TaskStatus::Pending {
            debug!(task_id = %id, status = %task.status, "Nothing to cancel");
            return Ok(false);
        }

        match self
            .inner
            .store
            .update(id, TaskPatch::finish(TaskStatus::Cancelled))
            .await
        {
            Ok(task) => {
                info!(task_id = %id, "Pending task cancelled");
                self.notify(task);
                Ok(true)
            }
            // Admitted and finished between the two reads.
            Err(StoreError::Rejected(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a finished task. Pending and running tasks are left alone.
    pub async fn delete(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let task = self
            .inner
            .store
            .get(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        if task.status.is_active() || self.active().contains_key(id) {
            debug!(task_id = %id, status = %task.status, "Refusing to delete active task");
            return Ok(false);
        }
        self.inner.store.delete(id).await?;
        self.notify(task);
        Ok(true)
    }

    /// Begin admitting tasks and handle SIGINT/SIGTERM with a graceful shutdown.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(max_concurrent = self.inner.max_concurrent, "Scheduler started");

        let scheduler = self.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("Termination signal received");
            scheduler.shutdown().await;
            scheduler.inner.stopped.cancel();
        });

        self.tick().await;
    }

    /// Cancel every active task and give runners a bounded time to clean up.
    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);

        let handles: Vec<(TaskId, JoinHandle<()>)> = {
            let mut active = self.active();
            active
                .iter_mut()
                .filter_map(|(id, run)| {
                    run.cancel.cancel();
                    run.handle.take().map(|h| (id.clone(), h))
                })
                .collect()
        };
        info!(tasks = handles.len(), "Shutting down scheduler");

        let drained = tokio::time::timeout(self.inner.shutdown_grace, async {
            for (id, handle) in handles {
                if let Err(e) = handle.await {
                    warn!(task_id = %id, error = %e, "Runner task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.active_count(),
                "Shutdown grace period elapsed with runners still active"
            );
        }
    }

    /// Admit pending tasks while slots are free.
    ///
    /// Concurrent calls are coalesced: a call made while another is admitting
    /// makes that one loop again instead of running alongside it.
    async fn tick(&self) {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) {
            return;
        }
        inner.retick.store(true, Ordering::SeqCst);
        if inner.ticking.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            inner.retick.store(false, Ordering::SeqCst);
            self.admit().await;
            inner.ticking.store(false, Ordering::SeqCst);
            if !inner.retick.load(Ordering::SeqCst) || inner.ticking.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn admit(&self) {
        while !self.inner.stopping.load(Ordering::SeqCst) {
            if self.active_count() >= self.inner.max_concurrent {
                break;
            }
            let next = {
                let pending = self.inner.store.list(Some(TaskStatus::Pending)).await;
                let active = self.active();
                pending.into_iter().find(|t| !active.contains_key(&t.id))
            };
            let Some(task) = next else {
                break;
            };
            self.launch(task.id);
        }
    }

    fn launch(&self, id: TaskId) {
        let cancel = CancellationToken::new();
        self.active().insert(
            id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                handle: None,
            },
        );
        debug!(task_id = %id, active = self.active_count(), "Launching runner");

        let scheduler = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            scheduler.inner.runner.run(&task_id, cancel).await;
            scheduler.active().remove(&task_id);
            debug!(task_id = %task_id, "Runner finished; slot released");
            scheduler.tick().await;
        });

        if let Some(run) = self.active().get_mut(&id) {
            run.handle = Some(handle);
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveRun>> {
        match self.inner.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, task: Task) {
        let _ = self.inner.events.send(HostEvent::TaskUpdated(task));
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use taskbox_core::WorkerEvent;

    use crate::container::{ContainerError, ContainerRuntime, ContainerSpec};
    use crate::runner::tests::{fast_timing, FakeContainers, FakeWorkspaces};
    use crate::store::MemoryTaskStore;

    /// Containers that run until stopped or released by the test, tracking
    /// how many are live at once.
    struct GatedContainers {
        inner: FakeContainers,
        live: AtomicUsize,
        peak: AtomicUsize,
        open: AtomicBool,
        started: Mutex<Vec<String>>,
    }

    impl GatedContainers {
        fn new() -> Self {
            Self {
                inner: FakeContainers::exiting(0, Vec::new()),
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                open: AtomicBool::new(false),
                started: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for GatedContainers {
        async fn ensure_image(&self) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
            self.inner.create(spec).await
        }

        async fn inject_credentials(&self, _id: &str) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn start(&self, id: &str) -> Result<(), ContainerError> {
            self.started.lock().unwrap().push(id.to_string());
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
            let code = loop {
                if self.inner.stopped.lock().unwrap().iter().any(|s| s == id) {
                    break 143;
                }
                if self.open.load(Ordering::SeqCst) {
                    break 0;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            };
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(code)
        }

        async fn stop(&self, id: &str) -> Result<(), ContainerError> {
            self.inner.stop(id).await
        }

        async fn remove(&self, id: &str) -> Result<(), ContainerError> {
            self.inner.remove(id).await
        }

        async fn is_running(&self, id: &str) -> Result<bool, ContainerError> {
            let started = self.started.lock().unwrap().iter().any(|s| s == id);
            let stopped = self.inner.stopped.lock().unwrap().iter().any(|s| s == id);
            Ok(started && !stopped && !self.open.load(Ordering::SeqCst))
        }

        async fn prune_orphans(&self, _keep: &HashSet<TaskId>) -> Result<usize, ContainerError> {
            Ok(0)
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        store: Arc<MemoryTaskStore>,
        containers: Arc<GatedContainers>,
        scheduler: Scheduler,
    }

    fn setup(max_concurrent: usize) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new(dir.path()));
        let containers = Arc::new(GatedContainers::new());
        let events = crate::events::channel();
        let runner = TaskRunner::new(
            store.clone(),
            Arc::new(FakeWorkspaces::default()),
            containers.clone(),
            events.clone(),
        )
        .with_timing(fast_timing());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(runner),
            events,
            max_concurrent,
            Duration::from_secs(2),
        );
        Setup {
            _dir: dir,
            store,
            containers,
            scheduler,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..5_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    async fn status(store: &MemoryTaskStore, id: &TaskId) -> TaskStatus {
        store.get(id).await.unwrap().status
    }

    async fn wait_for_status(store: &MemoryTaskStore, id: &TaskId, expected: TaskStatus) {
        for _ in 0..5_000 {
            if status(store, id).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("task {} never reached {}", id, expected);
    }

    #[tokio::test]
    async fn test_nothing_runs_before_start() {
        let s = setup(2);
        let task = s.scheduler.enqueue(NewTask::new("p", "/src")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.scheduler.active_count(), 0);
        assert_eq!(status(&s.store, &task.id).await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_admission_bound_and_fifo_order() {
        let s = setup(2);
        s.scheduler.start().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let task = s
                .scheduler
                .enqueue(NewTask::new(format!("task {}", i), "/src"))
                .await
                .unwrap();
            ids.push(task.id);
        }

        let containers = s.containers.clone();
        wait_until(|| containers.started.lock().unwrap().len() == 2).await;
        assert_eq!(s.scheduler.active_count(), 2);
        let running = s.store.list(Some(TaskStatus::Running)).await;
        assert!(running.len() <= 2);

        let first_two: HashSet<String> = s.containers.started.lock().unwrap().iter().cloned().collect();
        let expected: HashSet<String> = ids[..2].iter().map(|id| format!("c-{}", id)).collect();
        assert_eq!(first_two, expected);

        s.containers.open.store(true, Ordering::SeqCst);
        for id in &ids {
            wait_for_status(&s.store, id, TaskStatus::Completed).await;
        }
        assert!(s.containers.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(s.containers.started.lock().unwrap().len(), 5);
        wait_until(|| s.scheduler.active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let s = setup(1);
        s.scheduler.start().await;
        let first = s.scheduler.enqueue(NewTask::new("a", "/src")).await.unwrap();
        let second = s.scheduler.enqueue(NewTask::new("b", "/src")).await.unwrap();

        let containers = s.containers.clone();
        wait_until(|| containers.started.lock().unwrap().len() == 1).await;
        assert!(s.scheduler.cancel(&second.id).await.unwrap());
        assert_eq!(status(&s.store, &second.id).await, TaskStatus::Cancelled);

        s.containers.open.store(true, Ordering::SeqCst);
        wait_until(|| s.scheduler.active_count() == 0).await;
        assert_eq!(status(&s.store, &first.id).await, TaskStatus::Completed);
        assert_eq!(status(&s.store, &second.id).await, TaskStatus::Cancelled);
        assert_eq!(s.containers.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task_frees_slot() {
        let s = setup(1);
        s.scheduler.start().await;
        let first = s.scheduler.enqueue(NewTask::new("a", "/src")).await.unwrap();
        let second = s.scheduler.enqueue(NewTask::new("b", "/src")).await.unwrap();

        let containers = s.containers.clone();
        wait_until(|| containers.started.lock().unwrap().len() == 1).await;
        assert!(s.scheduler.cancel(&first.id).await.unwrap());

        // The freed slot goes to the next task without another trigger.
        wait_until(|| containers.started.lock().unwrap().len() == 2).await;
        assert_eq!(status(&s.store, &first.id).await, TaskStatus::Cancelled);
        assert_eq!(status(&s.store, &second.id).await, TaskStatus::Running);

        // Terminal tasks cannot be cancelled again.
        assert!(!s.scheduler.cancel(&first.id).await.unwrap());
        s.scheduler.shutdown().await;
        assert_eq!(status(&s.store, &second.id).await, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_delete_refuses_active_tasks() {
        let s = setup(1);
        s.scheduler.start().await;
        let first = s.scheduler.enqueue(NewTask::new("a", "/src")).await.unwrap();
        let second = s.scheduler.enqueue(NewTask::new("b", "/src")).await.unwrap();

        let containers = s.containers.clone();
        wait_until(|| containers.started.lock().unwrap().len() == 1).await;
        assert!(!s.scheduler.delete(&first.id).await.unwrap());
        assert!(!s.scheduler.delete(&second.id).await.unwrap());

        s.scheduler.cancel(&second.id).await.unwrap();
        assert!(s.scheduler.delete(&second.id).await.unwrap());
        assert!(s.store.get(&second.id).await.is_none());
        assert!(matches!(
            s.scheduler.delete(&second.id).await,
            Err(SchedulerError::TaskNotFound(_))
        ));
        s.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything_and_stops_admission() {
        let s = setup(2);
        s.scheduler.start().await;
        let a = s.scheduler.enqueue(NewTask::new("a", "/src")).await.unwrap();
        let b = s.scheduler.enqueue(NewTask::new("b", "/src")).await.unwrap();
        let c = s.scheduler.enqueue(NewTask::new("c", "/src")).await.unwrap();

        let containers = s.containers.clone();
        wait_until(|| containers.started.lock().unwrap().len() == 2).await;
        s.scheduler.shutdown().await;

        assert_eq!(status(&s.store, &a.id).await, TaskStatus::Cancelled);
        assert_eq!(status(&s.store, &b.id).await, TaskStatus::Cancelled);
        assert_eq!(status(&s.store, &c.id).await, TaskStatus::Pending);
        assert_eq!(s.containers.started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_events_reach_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new(dir.path()));
        let events = crate::events::channel();
        let containers = FakeContainers::exiting(0, vec![WorkerEvent::system("hello")]);
        let runner = TaskRunner::new(
            store.clone(),
            Arc::new(FakeWorkspaces::default()),
            Arc::new(containers),
            events.clone(),
        )
        .with_timing(fast_timing());
        let scheduler = Scheduler::new(store, Arc::new(runner), events, 1, Duration::from_secs(1));
        let mut rx = scheduler.subscribe();
        scheduler.start().await;

        let task = scheduler.enqueue(NewTask::new("p", "/src")).await.unwrap();
        let mut saw_event = false;
        loop {
            match rx.recv().await.unwrap() {
                HostEvent::Worker { task_id, event } => {
                    assert_eq!(task_id, task.id);
                    assert_eq!(event, WorkerEvent::system("hello"));
                    saw_event = true;
                }
                HostEvent::TaskUpdated(t) if t.id == task.id && t.is_terminal() => break,
                _ => {}
            }
        }
        assert!(saw_event);
    }
}
