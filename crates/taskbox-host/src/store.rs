//! Task store.
//!
//! The store exclusively owns task records. Every mutation goes through
//! [`TaskStore::update`], which applies a [`TaskPatch`] to the current record
//! atomically, so concurrent callers never overwrite each other's fields.
//!
//! [`SqliteTaskStore`] is the durable store. Several host processes may open
//! the same database; each update is one write transaction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskbox_core::{CoreError, NewTask, Task, TaskId, TaskPatch, TaskStatus};

/// How long a write waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_status ON tasks(status);
";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Rejected(#[from] CoreError),

    #[error("Task store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Stored task record is invalid: {0}")]
    Record(#[from] serde_json::Error),
}

/// Task persistence seam used by the scheduler and runners.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `pending` task.
    async fn create(&self, input: NewTask) -> Result<Task, StoreError>;

    async fn get(&self, id: &TaskId) -> Option<Task>;

    /// Apply a patch to the stored record and return the result.
    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError>;

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError>;

    /// Tasks in creation order, optionally filtered by status.
    async fn list(&self, status: Option<TaskStatus>) -> Vec<Task>;
}

/// Validate the input and build its pending record, creating its log directory.
async fn new_record(logs_dir: &std::path::Path, input: NewTask) -> Result<Task, StoreError> {
    input.validate()?;
    let id = TaskId::generate();
    let log_dir = logs_dir.join(id.as_str());
    tokio::fs::create_dir_all(&log_dir).await?;
    Ok(Task::new(id, input, log_dir))
}

/// SQLite-backed store shared safely between host processes.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    logs_dir: PathBuf,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(
        logs_dir: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        info!(path = %path.display(), "Task database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            logs_dir: logs_dir.into(),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn parse_record(record: &str) -> Result<Task, StoreError> {
    Ok(serde_json::from_str(record)?)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, input: NewTask) -> Result<Task, StoreError> {
        let task = new_record(&self.logs_dir, input).await?;
        let record = serde_json::to_string(&task)?;
        let (id, status) = (task.id.to_string(), task.status.as_str());

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, record) VALUES (?1, ?2, ?3)",
                params![id, status, record],
            )?;
            Ok(())
        })
        .await?;

        info!(task_id = %task.id, "Task created");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Option<Task> {
        let key = id.to_string();
        let result = self
            .with_conn(move |conn| {
                let record: Option<String> = conn
                    .query_row("SELECT record FROM tasks WHERE id = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                record.as_deref().map(parse_record).transpose()
            })
            .await;
        match result {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to read task");
                None
            }
        }
    }

    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front, so the read below
            // cannot be invalidated by another process before the write.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM tasks WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let mut task = match record {
                Some(record) => parse_record(&record)?,
                None => return Err(StoreError::NotFound(id)),
            };

            patch.apply(&mut task)?;
            tx.execute(
                "UPDATE tasks SET status = ?1, record = ?2 WHERE id = ?3",
                params![task.status.as_str(), serde_json::to_string(&task)?, id.as_str()],
            )?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let key = id.to_string();
        let deleted = self
            .with_conn(move |conn| Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", params![key])?))
            .await?;
        if deleted > 0 {
            info!(task_id = %id, "Task deleted");
        }
        Ok(())
    }

    async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let result: Result<Vec<Task>, StoreError> = self
            .with_conn(move |conn| {
                let records: Vec<String> = match status {
                    Some(status) => {
                        let mut stmt = conn
                            .prepare("SELECT record FROM tasks WHERE status = ?1 ORDER BY seq")?;
                        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
                        let records = rows.collect::<Result<Vec<String>, _>>()?;
                        records
                    }
                    None => {
                        let mut stmt = conn.prepare("SELECT record FROM tasks ORDER BY seq")?;
                        let rows = stmt.query_map([], |row| row.get(0))?;
                        let records = rows.collect::<Result<Vec<String>, _>>()?;
                        records
                    }
                };
                records.iter().map(|r| parse_record(r)).collect()
            })
            .await;
        match result {
            Ok(tasks) => {
                debug!(count = %tasks.len(), "Listed tasks");
                tasks
            }
            Err(e) => {
                warn!(error = %e, "Failed to list tasks");
                Vec::new()
            }
        }
    }
}

#[derive(Default)]
struct Tasks {
    by_id: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

impl Tasks {
    fn ordered(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}

/// Process-local store, for embedding and tests.
pub struct MemoryTaskStore {
    tasks: RwLock<Tasks>,
    logs_dir: PathBuf,
}

impl MemoryTaskStore {
    /// Task log directories are created under `logs_dir`.
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks: RwLock::new(Tasks::default()),
            logs_dir: logs_dir.into(),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, input: NewTask) -> Result<Task, StoreError> {
        let task = new_record(&self.logs_dir, input).await?;

        let mut tasks = self.tasks.write().await;
        tasks.order.push(task.id.clone());
        tasks.by_id.insert(task.id.clone(), task.clone());

        info!(task_id = %task.id, "Task created");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.by_id.get(id).cloned()
    }

    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .by_id
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut updated = task.clone();
        patch.apply(&mut updated)?;
        *task = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.by_id.remove(id).is_some() {
            tasks.order.retain(|t| t != id);
            info!(task_id = %id, "Task deleted");
        }
        Ok(())
    }

    async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .ordered()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect()
    }
}
