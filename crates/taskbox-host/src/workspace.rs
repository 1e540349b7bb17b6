//! Per-task workspaces.
//!
//! Each task works in a standalone clone of its project (`git clone
//! --no-local`), so the workspace carries its own object store and can be
//! bind-mounted into a container. Results come back as a branch fetched into
//! the source repository; the source's checked-out branch is never touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use taskbox_core::TaskId;

/// Branch namespace for integrated results.
pub const BRANCH_PREFIX: &str = "taskbox";

/// Commit message for changes the agent left uncommitted.
const UNCOMMITTED_MESSAGE: &str = "Uncommitted changes from taskbox task";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Source repository not found: {0}")]
    SourceMissing(PathBuf),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace lifecycle seam used by the runner.
#[async_trait]
pub trait Workspaces: Send + Sync {
    /// Create a fresh, self-contained copy of `source` for the task.
    async fn provision(&self, source: &Path, id: &TaskId) -> Result<PathBuf, WorkspaceError>;

    /// Fold the workspace's commits back into `source` as a branch.
    ///
    /// Returns the branch name, or `None` when there is nothing to integrate.
    /// Never fails: git errors mean "nothing to integrate".
    async fn integrate(&self, source: &Path, workspace: &Path, id: &TaskId) -> Option<String>;

    /// Remove the workspace. Missing workspaces are not an error.
    async fn release(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    /// Remove every workspace not belonging to one of `keep`.
    async fn prune_orphans(&self, keep: &HashSet<TaskId>) -> Result<usize, WorkspaceError>;
}

/// Git clones under a single root directory, one per task id.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    root: PathBuf,
}

impl GitWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, id: &TaskId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn branch_name(id: &TaskId) -> String {
        format!("{}/{}", BRANCH_PREFIX, id)
    }

    async fn head(repo: &Path) -> Result<String, WorkspaceError> {
        git(repo, &["rev-parse", "HEAD"]).await
    }

    /// Commit anything the agent left behind. Best-effort.
    async fn commit_leftovers(workspace: &Path) {
        let status = match git(workspace, &["status", "--porcelain"]).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to read workspace status");
                return;
            }
        };
        if status.is_empty() {
            return;
        }
        let committed = async {
            git(workspace, &["add", "-A"]).await?;
            git(workspace, &["commit", "-m", UNCOMMITTED_MESSAGE]).await
        };
        match committed.await {
            Ok(_) => debug!(workspace = %workspace.display(), "Committed leftover changes"),
            Err(e) => warn!(error = %e, "Failed to commit leftover changes"),
        }
    }
}

/// Run git in `cwd` and return its trimmed stdout.
async fn git(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(WorkspaceError::Spawn)?;

    if !output.status.success() {
        return Err(WorkspaceError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn remove_dir(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Workspaces for GitWorkspaces {
    async fn provision(&self, source: &Path, id: &TaskId) -> Result<PathBuf, WorkspaceError> {
        if !source.is_dir() {
            return Err(WorkspaceError::SourceMissing(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let target = self.path_for(id);
        remove_dir(&target).await?;

        let source_arg = source.to_string_lossy();
        let target_arg = target.to_string_lossy();
        if let Err(e) = git(
            &self.root,
            &["clone", "--no-local", "--quiet", &source_arg, &target_arg],
        )
        .await
        {
            let _ = remove_dir(&target).await;
            return Err(e);
        }

        info!(task_id = %id, workspace = %target.display(), "Workspace provisioned");
        Ok(target)
    }

    async fn integrate(&self, source: &Path, workspace: &Path, id: &TaskId) -> Option<String> {
        Self::commit_leftovers(workspace).await;

        let (workspace_head, source_head) =
            match tokio::try_join!(Self::head(workspace), Self::head(source)) {
                Ok(heads) => heads,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Cannot compare workspace with source");
                    return None;
                }
            };
        if workspace_head == source_head {
            debug!(task_id = %id, "Workspace has no new commits");
            return None;
        }

        let branch = Self::branch_name(id);
        let refspec = format!("HEAD:refs/heads/{}", branch);
        let workspace_arg = workspace.to_string_lossy();
        match git(source, &["fetch", "--quiet", &workspace_arg, &refspec]).await {
            Ok(_) => {
                info!(task_id = %id, branch = %branch, "Task results integrated");
                Some(branch)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to fetch workspace into source");
                None
            }
        }
    }

    async fn release(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        remove_dir(workspace).await?;
        debug!(workspace = %workspace.display(), "Workspace released");
        Ok(())
    }

    async fn prune_orphans(&self, keep: &HashSet<TaskId>) -> Result<usize, WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut pruned = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if keep.contains(&TaskId::new(name.as_str())) {
                continue;
            }
            remove_dir(&entry.path()).await?;
            pruned += 1;
        }

        if pruned > 0 {
            info!(pruned, "Pruned orphan workspaces");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn run(cwd: &Path, args: &[&str]) {
        let mut full = vec!["-c", "user.name=Test", "-c", "user.email=test@example.com"];
        full.extend_from_slice(args);
        git(cwd, &full).await.unwrap();
    }

    async fn source_repo(dir: &Path) -> PathBuf {
        let source = dir.join("source");
        std::fs::create_dir_all(&source).unwrap();
        run(&source, &["init", "--quiet"]).await;
        std::fs::write(source.join("README.md"), "hello\n").unwrap();
        run(&source, &["add", "-A"]).await;
        run(&source, &["commit", "--quiet", "-m", "init"]).await;
        source
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = GitWorkspaces::new(dir.path());
        let ws = dir.path().join("abc");
        std::fs::create_dir_all(ws.join("nested")).unwrap();

        workspaces.release(&ws).await.unwrap();
        workspaces.release(&ws).await.unwrap();
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_active_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = GitWorkspaces::new(dir.path());
        for name in ["live", "dead1", "dead2"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("stray.txt"), "").unwrap();

        let keep: HashSet<TaskId> = [TaskId::new("live")].into_iter().collect();
        let pruned = workspaces.prune_orphans(&keep).await.unwrap();

        assert_eq!(pruned, 2);
        assert!(dir.path().join("live").is_dir());
        assert!(!dir.path().join("dead1").exists());
        assert!(dir.path().join("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_prune_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = GitWorkspaces::new(dir.path().join("missing"));
        assert_eq!(workspaces.prune_orphans(&HashSet::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_provision_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = GitWorkspaces::new(dir.path().join("ws"));
        let err = workspaces
            .provision(&dir.path().join("nope"), &TaskId::new("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_unchanged_workspace_integrates_nothing() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = source_repo(dir.path()).await;
        let workspaces = GitWorkspaces::new(dir.path().join("ws"));
        let id = TaskId::new("t1");

        let ws = workspaces.provision(&source, &id).await.unwrap();
        assert!(ws.join(".git").is_dir());
        assert!(ws.join("README.md").is_file());

        assert_eq!(workspaces.integrate(&source, &ws, &id).await, None);
    }

    #[tokio::test]
    async fn test_new_commits_become_a_branch() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = source_repo(dir.path()).await;
        let workspaces = GitWorkspaces::new(dir.path().join("ws"));
        let id = TaskId::new("t2");

        let ws = workspaces.provision(&source, &id).await.unwrap();
        std::fs::write(ws.join("feature.txt"), "done\n").unwrap();
        run(&ws, &["add", "-A"]).await;
        run(&ws, &["commit", "--quiet", "-m", "feature"]).await;
        let ws_head = GitWorkspaces::head(&ws).await.unwrap();
        let source_head = GitWorkspaces::head(&source).await.unwrap();

        let branch = workspaces.integrate(&source, &ws, &id).await;
        assert_eq!(branch.as_deref(), Some("taskbox/t2"));

        let branch_head = git(&source, &["rev-parse", "refs/heads/taskbox/t2"]).await.unwrap();
        assert_eq!(branch_head, ws_head);
        // The checked-out branch is untouched.
        assert_eq!(GitWorkspaces::head(&source).await.unwrap(), source_head);

        workspaces.release(&ws).await.unwrap();
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn test_provision_replaces_stale_workspace() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = source_repo(dir.path()).await;
        let workspaces = GitWorkspaces::new(dir.path().join("ws"));
        let id = TaskId::new("t3");

        let stale = workspaces.path_for(&id);
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk"), "").unwrap();

        let ws = workspaces.provision(&source, &id).await.unwrap();
        assert_eq!(ws, stale);
        assert!(!ws.join("junk").exists());
        assert!(ws.join("README.md").is_file());
    }
}
