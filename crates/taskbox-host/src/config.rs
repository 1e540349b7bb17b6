//! Host configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use taskbox_core::TaskId;
use thiserror::Error;

/// Environment variable overriding the base directory.
pub const HOME_ENV: &str = "TASKBOX_HOME";

/// Environment variable overriding the concurrency limit.
pub const MAX_CONCURRENT_ENV: &str = "TASKBOX_MAX_CONCURRENT";

/// Environment variable overriding the worker image.
pub const IMAGE_ENV: &str = "TASKBOX_IMAGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine home directory; set TASKBOX_HOME")]
    NoHome,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root of everything the host stores.
    pub base_dir: PathBuf,

    /// Maximum number of tasks with a live container.
    pub max_concurrent: usize,

    /// Worker image name.
    pub image: String,

    /// Docker build context used when the image is missing.
    pub build_context: PathBuf,

    /// Container memory ceiling in megabytes.
    pub memory_mb: u64,

    /// Container CPU ceiling.
    pub cpus: f64,

    /// Event log poll interval.
    pub tail_interval: Duration,

    /// Time the tailer keeps reading after the container exits.
    pub drain_grace: Duration,

    /// Seconds docker waits after SIGTERM before killing a container.
    pub stop_grace_secs: u64,

    /// Time `shutdown` waits for runners to clean up.
    pub shutdown_grace: Duration,

    /// Label identifying this host instance's containers.
    pub session: String,
}

impl HostConfig {
    /// Defaults rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_concurrent: 3,
            image: "taskbox-worker:latest".to_string(),
            build_context: PathBuf::from("."),
            memory_mb: 4096,
            cpus: 2.0,
            tail_interval: Duration::from_millis(500),
            drain_grace: Duration::from_millis(1000),
            stop_grace_secs: 10,
            shutdown_grace: Duration::from_secs(2),
            session: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_dir = match std::env::var_os(HOME_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".taskbox"))
                .ok_or(ConfigError::NoHome)?,
        };
        let mut config = Self::new(base_dir);

        if let Ok(value) = std::env::var(MAX_CONCURRENT_ENV) {
            config.max_concurrent = parse_concurrency(&value)?;
        }
        if let Ok(image) = std::env::var(IMAGE_ENV) {
            if !image.trim().is_empty() {
                config.image = image;
            }
        }
        Ok(config)
    }

    pub fn paths(&self) -> HostPaths {
        HostPaths::new(&self.base_dir)
    }
}

fn parse_concurrency(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            name: MAX_CONCURRENT_ENV,
            value: value.to_string(),
        }),
    }
}

/// Directory layout under the base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub base: PathBuf,
    pub logs: PathBuf,
    pub workspaces: PathBuf,
    pub auth: PathBuf,
    pub claude_json: PathBuf,
    pub tasks_db: PathBuf,
}

impl HostPaths {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            logs: base.join("logs"),
            workspaces: base.join("workspaces"),
            auth: base.join("auth"),
            claude_json: base.join("claude.json"),
            tasks_db: base.join("tasks.db"),
            base,
        }
    }

    pub fn task_log_dir(&self, id: &TaskId) -> PathBuf {
        self.logs.join(id.as_str())
    }

    pub fn task_events_file(&self, id: &TaskId) -> PathBuf {
        self.task_log_dir(id).join("events.jsonl")
    }

    pub fn task_state_file(&self, id: &TaskId) -> PathBuf {
        self.task_log_dir(id).join("state.json")
    }

    pub fn workspace(&self, id: &TaskId) -> PathBuf {
        self.workspaces.join(id.as_str())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.logs)?;
        std::fs::create_dir_all(&self.workspaces)?;
        std::fs::create_dir_all(&self.auth)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = HostPaths::new("/data");
        let id = TaskId::new("abc123");
        assert_eq!(paths.task_events_file(&id), PathBuf::from("/data/logs/abc123/events.jsonl"));
        assert_eq!(paths.task_state_file(&id), PathBuf::from("/data/logs/abc123/state.json"));
        assert_eq!(paths.workspace(&id), PathBuf::from("/data/workspaces/abc123"));
        assert_eq!(paths.tasks_db, PathBuf::from("/data/tasks.db"));
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::new("/data");
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.memory_mb, 4096);
        assert_eq!(config.tail_interval, Duration::from_millis(500));
        assert_eq!(config.session.len(), 32);
    }

    #[test]
    fn test_concurrency_must_be_positive() {
        assert_eq!(parse_concurrency(" 5 ").unwrap(), 5);
        assert!(parse_concurrency("0").is_err());
        assert!(parse_concurrency("many").is_err());
    }
}
