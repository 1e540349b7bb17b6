//! Container runtime seam and the docker CLI adapter.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use taskbox_core::{CompletionCheck, TaskId, TaskLimits};

use crate::config::HostConfig;

/// Label carried by every container this system creates.
pub const LABEL: &str = "taskbox";
pub const LABEL_TASK_ID: &str = "taskbox.task-id";
pub const LABEL_SESSION: &str = "taskbox.session";

/// Mount points inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
pub const CONTAINER_LOGS: &str = "/logs";
const CONTAINER_HOME: &str = "/home/coder";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to run docker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("docker {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Failed to build image {image}: {reason}")]
    ImageBuild { image: String, reason: String },

    #[error("Unexpected docker output: {0}")]
    InvalidOutput(String),

    #[error("Invalid completion checks: {0}")]
    Checks(#[from] taskbox_core::CoreError),
}

/// Everything needed to launch one task's worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub task_id: TaskId,
    pub prompt: String,
    pub limits: TaskLimits,
    pub completion_checks: Vec<CompletionCheck>,
    pub fresh_context: bool,
    /// Host path mounted at `/workspace`.
    pub workspace: PathBuf,
    /// Host path mounted at `/logs`.
    pub log_dir: PathBuf,
}

impl ContainerSpec {
    /// Worker command line (the container launch contract).
    pub fn worker_args(&self) -> Result<Vec<String>, ContainerError> {
        let mut args = vec![
            "--prompt".to_string(),
            self.prompt.clone(),
            "--max-iterations".to_string(),
            self.limits.max_iterations.to_string(),
            "--max-hours".to_string(),
            self.limits.max_hours.to_string(),
            "--max-budget".to_string(),
            self.limits.max_budget_usd.to_string(),
            "--turns-per-iteration".to_string(),
            self.limits.turns_per_iteration.to_string(),
            "--log-dir".to_string(),
            CONTAINER_LOGS.to_string(),
            "--completion-checks".to_string(),
            CompletionCheck::encode_list(&self.completion_checks)?,
        ];
        if self.fresh_context {
            args.push("--fresh-context".to_string());
        }
        Ok(args)
    }
}

/// Container lifecycle seam used by the runner and scheduler.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure the worker image exists, building it if absent.
    async fn ensure_image(&self) -> Result<(), ContainerError>;

    /// Create (but do not start) the task's container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Copy agent credentials into a created container.
    async fn inject_credentials(&self, id: &str) -> Result<(), ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, ContainerError>;

    /// Graceful stop (SIGTERM, then SIGKILL after the grace period).
    async fn stop(&self, id: &str) -> Result<(), ContainerError>;

    /// Force-remove. Removing a missing container is not an error.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;

    /// Whether the container exists and is running.
    async fn is_running(&self, id: &str) -> Result<bool, ContainerError>;

    /// Remove containers from other host sessions, except those of the
    /// tasks in `keep`.
    async fn prune_orphans(&self, keep: &HashSet<TaskId>) -> Result<usize, ContainerError>;
}

/// [`ContainerRuntime`] backed by the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    pub docker: String,
    pub image: String,
    pub build_context: PathBuf,
    pub memory_mb: u64,
    pub cpus: f64,
    pub stop_grace_secs: u64,
    pub session: String,
    pub auth_dir: PathBuf,
    pub claude_json: PathBuf,
}

impl DockerCli {
    pub fn from_config(config: &HostConfig) -> Self {
        let paths = config.paths();
        Self {
            docker: "docker".to_string(),
            image: config.image.clone(),
            build_context: config.build_context.clone(),
            memory_mb: config.memory_mb,
            cpus: config.cpus,
            stop_grace_secs: config.stop_grace_secs,
            session: config.session.clone(),
            auth_dir: paths.auth,
            claude_json: paths.claude_json,
        }
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &ContainerSpec) -> Result<Vec<String>, ContainerError> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--label".into(),
            format!("{}=true", LABEL),
            "--label".into(),
            format!("{}={}", LABEL_TASK_ID, spec.task_id),
            "--label".into(),
            format!("{}={}", LABEL_SESSION, self.session),
            "--init".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--memory".into(),
            format!("{}m", self.memory_mb),
            "--cpus".into(),
            self.cpus.to_string(),
            "-v".into(),
            format!("{}:{}:rw", spec.workspace.display(), CONTAINER_WORKSPACE),
            "-v".into(),
            format!("{}:{}:rw", spec.log_dir.display(), CONTAINER_LOGS),
            "-e".into(),
            format!("HOME={}", CONTAINER_HOME),
            "-e".into(),
            "TERM=xterm-256color".into(),
            self.image.clone(),
        ];
        args.extend(spec.worker_args()?);
        Ok(args)
    }

    /// Run docker and return trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, ContainerError> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ContainerError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Whether a docker failure just means the container is already gone or stopped.
fn is_gone(err: &ContainerError) -> bool {
    match err {
        ContainerError::Command { stderr, .. } => {
            let stderr = stderr.to_lowercase();
            stderr.contains("no such container") || stderr.contains("is not running")
        }
        _ => false,
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_image(&self) -> Result<(), ContainerError> {
        if self.run(&["image", "inspect", &self.image]).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.image, context = %self.build_context.display(), "Building worker image");
        let context = self.build_context.to_string_lossy();
        self.run(&["build", "-t", &self.image, &context])
            .await
            .map_err(|e| ContainerError::ImageBuild {
                image: self.image.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let args = self.create_args(spec)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&args).await?;
        if id.is_empty() {
            return Err(ContainerError::InvalidOutput("empty container id".to_string()));
        }
        info!(task_id = %spec.task_id, container_id = %id, "Container created");
        Ok(id)
    }

    async fn inject_credentials(&self, id: &str) -> Result<(), ContainerError> {
        if self.auth_dir.is_dir() {
            // `<dir>/.` copies the directory's contents, creating the target.
            let source = format!("{}/.", self.auth_dir.display());
            let target = format!("{}:{}/.claude", id, CONTAINER_HOME);
            self.run(&["cp", &source, &target]).await?;
        }
        if self.claude_json.is_file() {
            let source = self.claude_json.to_string_lossy();
            let target = format!("{}:{}/.claude.json", id, CONTAINER_HOME);
            self.run(&["cp", &source, &target]).await?;
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let output = self.run(&["wait", id]).await?;
        let code = output.lines().last().and_then(|line| line.trim().parse().ok());
        code.ok_or(ContainerError::InvalidOutput(output))
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        let grace = self.stop_grace_secs.to_string();
        match self.run(&["stop", "-t", &grace, id]).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        match self.run(&["rm", "-f", id]).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, ContainerError> {
        match self.run(&["inspect", "-f", "{{.State.Running}}", id]).await {
            Ok(output) => Ok(output == "true"),
            Err(e) if is_gone(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn prune_orphans(&self, keep: &HashSet<TaskId>) -> Result<usize, ContainerError> {
        let filter = format!("label={}=true", LABEL);
        let format = format!(
            "{{{{.ID}}}}|{{{{.Label \"{}\"}}}}|{{{{.Label \"{}\"}}}}",
            LABEL_SESSION, LABEL_TASK_ID
        );
        let listing = self
            .run(&["ps", "-a", "--filter", &filter, "--format", &format])
            .await?;

        let mut pruned = 0;
        for listed in parse_listing(&listing) {
            if listed.session == self.session || keep.contains(&TaskId::new(listed.task_id)) {
                continue;
            }
            let id = listed.id;
            match self.remove(id).await {
                Ok(()) => pruned += 1,
                Err(e) => warn!(container_id = %id, error = %e, "Failed to remove orphan container"),
            }
        }
        if pruned > 0 {
            info!(pruned, "Pruned orphan containers");
        }
        Ok(pruned)
    }
}

/// One row of the labelled container listing.
#[derive(Debug, PartialEq, Eq)]
struct Listed<'a> {
    id: &'a str,
    session: &'a str,
    task_id: &'a str,
}

/// Parse `<id>|<session>|<task id>` lines; labels may be empty.
fn parse_listing(listing: &str) -> Vec<Listed<'_>> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|').map(str::trim);
            let id = fields.next().filter(|id| !id.is_empty())?;
            Some(Listed {
                id,
                session: fields.next().unwrap_or(""),
                task_id: fields.next().unwrap_or(""),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            task_id: TaskId::new("abc123"),
            prompt: "Fix the bug".to_string(),
            limits: TaskLimits::default(),
            completion_checks: vec![CompletionCheck::FileExists {
                path: "DONE".to_string(),
            }],
            fresh_context: false,
            workspace: PathBuf::from("/host/ws/abc123"),
            log_dir: PathBuf::from("/host/logs/abc123"),
        }
    }

    fn docker() -> DockerCli {
        let mut config = HostConfig::new("/host");
        config.session = "sess1".to_string();
        DockerCli::from_config(&config)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_worker_args_follow_launch_contract() {
        let args = spec().worker_args().unwrap();
        assert_eq!(value_after(&args, "--prompt"), vec!["Fix the bug"]);
        assert_eq!(value_after(&args, "--max-iterations"), vec!["10"]);
        assert_eq!(value_after(&args, "--max-hours"), vec!["4"]);
        assert_eq!(value_after(&args, "--max-budget"), vec!["30"]);
        assert_eq!(value_after(&args, "--turns-per-iteration"), vec!["30"]);
        assert_eq!(value_after(&args, "--log-dir"), vec!["/logs"]);

        let checks = value_after(&args, "--completion-checks")[0];
        let parsed = CompletionCheck::parse_list(checks).unwrap();
        assert_eq!(parsed, spec().completion_checks);
        assert!(!args.contains(&"--fresh-context".to_string()));

        let fresh = ContainerSpec {
            fresh_context: true,
            ..spec()
        };
        let args = fresh.worker_args().unwrap();
        assert_eq!(args.last().map(String::as_str), Some("--fresh-context"));
        assert_eq!(value_after(&args, "--max-iterations"), vec!["10"]);
    }

    #[test]
    fn test_create_args() {
        let args = docker().create_args(&spec()).unwrap();
        assert_eq!(args[0], "create");
        assert_eq!(
            value_after(&args, "--label"),
            vec!["taskbox=true", "taskbox.task-id=abc123", "taskbox.session=sess1"]
        );
        assert_eq!(
            value_after(&args, "-v"),
            vec!["/host/ws/abc123:/workspace:rw", "/host/logs/abc123:/logs:rw"]
        );
        assert_eq!(value_after(&args, "--memory"), vec!["4096m"]);
        assert_eq!(value_after(&args, "--cpus"), vec!["2"]);
        assert!(args.contains(&"--init".to_string()));
        assert_eq!(value_after(&args, "--security-opt"), vec!["no-new-privileges"]);

        // The image comes right before the worker arguments.
        let image_at = args.iter().position(|a| a == "taskbox-worker:latest").unwrap();
        assert_eq!(args[image_at + 1], "--prompt");
    }

    #[test]
    fn test_parse_listing() {
        let listing = "aaa|sess1|t1\nbbb||\nccc|other|t3\nddd\n\n";
        let rows: Vec<(&str, &str, &str)> = parse_listing(listing)
            .into_iter()
            .map(|l| (l.id, l.session, l.task_id))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("aaa", "sess1", "t1"),
                ("bbb", "", ""),
                ("ccc", "other", "t3"),
                ("ddd", "", ""),
            ]
        );
    }

    /// A `docker` stand-in answering `ps`, `inspect` and `rm`.
    fn scripted_docker(dir: &std::path::Path) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let removed = dir.join("removed");
        let script = format!(
            r#"#!/bin/sh
case "$1" in
  ps) printf 'aaa|sess1|t1\nbbb|old|t2\nccc|old|t3\n' ;;
  inspect)
    if [ "$4" = "aaa" ]; then echo true;
    elif [ "$4" = "bbb" ]; then echo false;
    else echo "Error: No such container: $4" >&2; exit 1; fi ;;
  rm) echo "$3" >> {} ;;
esac
"#,
            removed.display()
        );
        let path = dir.join("docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut docker = docker();
        docker.docker = path.to_string_lossy().into_owned();
        docker
    }

    #[tokio::test]
    async fn test_prune_spares_current_session_and_kept_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let docker = scripted_docker(dir.path());

        let keep: HashSet<TaskId> = [TaskId::new("t2")].into_iter().collect();
        assert_eq!(docker.prune_orphans(&keep).await.unwrap(), 1);

        let removed = std::fs::read_to_string(dir.path().join("removed")).unwrap();
        assert_eq!(removed.lines().collect::<Vec<_>>(), vec!["ccc"]);
    }

    #[tokio::test]
    async fn test_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let docker = scripted_docker(dir.path());
        assert!(docker.is_running("aaa").await.unwrap());
        assert!(!docker.is_running("bbb").await.unwrap());
        assert!(!docker.is_running("zzz").await.unwrap());
    }

    #[test]
    fn test_gone_errors() {
        let gone = ContainerError::Command {
            command: "rm".to_string(),
            stderr: "Error response from daemon: No such container: abc".to_string(),
        };
        assert!(is_gone(&gone));
        let other = ContainerError::Command {
            command: "rm".to_string(),
            stderr: "permission denied".to_string(),
        };
        assert!(!is_gone(&other));
    }
}
