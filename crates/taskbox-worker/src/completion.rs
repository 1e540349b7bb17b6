//! Completion verifier.
//!
//! Runs the task's configured checks against the workspace before a
//! `TASK_COMPLETE` signal is trusted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskbox_core::CompletionCheck;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::prompt::review_prompt;

/// Maximum length of a review failure reason.
const REVIEW_REASON_CHARS: usize = 200;

/// Runs an AI review over the workspace and returns the reviewer's text.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, workspace: &Path, prompt: &str) -> Result<String, AgentError>;
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    /// The check ran and did not pass.
    Failed(Option<String>),
    /// The check could not be evaluated (spawn failure, timeout, bad pattern).
    Errored(String),
}

impl CheckOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub id: String,
    pub outcome: CheckOutcome,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            CheckOutcome::Passed => write!(f, "{}", self.id),
            CheckOutcome::Failed(None) => write!(f, "{}", self.id),
            CheckOutcome::Failed(Some(reason)) => write!(f, "{}: {}", self.id, reason),
            CheckOutcome::Errored(reason) => write!(f, "error: {}: {}", self.id, reason),
        }
    }
}

/// Results of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub results: Vec<CheckResult>,
}

impl CompletionReport {
    /// True only when every check passed. An empty report passes.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_passed())
    }

    /// Comma-joined description of the checks that did not pass.
    pub fn summary(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_passed())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Evaluates completion checks inside one workspace.
pub struct CompletionVerifier {
    workspace: PathBuf,
    task_prompt: Option<String>,
    reviewer: Option<Arc<dyn Reviewer>>,
}

impl CompletionVerifier {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            task_prompt: None,
            reviewer: None,
        }
    }

    /// Include the original task in review prompts.
    pub fn with_task_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.task_prompt = Some(prompt.into());
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Run every check in order.
    pub async fn verify(&self, checks: &[CompletionCheck]) -> CompletionReport {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = self.run(check).await;
            debug!(check = %check.id(), ?outcome, "Completion check finished");
            results.push(CheckResult {
                id: check.id(),
                outcome,
            });
        }
        let report = CompletionReport { results };
        info!(
            checks = checks.len(),
            all_passed = report.all_passed(),
            "Completion checks evaluated"
        );
        report
    }

    async fn run(&self, check: &CompletionCheck) -> CheckOutcome {
        match check {
            CompletionCheck::Command { cmd, .. } => {
                let secs = check
                    .timeout_secs()
                    .unwrap_or(taskbox_core::check::DEFAULT_COMMAND_TIMEOUT_SECS);
                self.run_command(cmd, Duration::from_secs(secs)).await
            }
            CompletionCheck::FileExists { path } => {
                if self.workspace.join(path).exists() {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::Failed(Some("not found".to_string()))
                }
            }
            CompletionCheck::GlobExists { pattern, min_count } => {
                self.count_glob(pattern, *min_count)
            }
            CompletionCheck::Review { prompt, files } => {
                self.run_review(prompt, files.as_deref()).await
            }
        }
    }

    async fn run_command(&self, cmd: &str, timeout: Duration) -> CheckOutcome {
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return CheckOutcome::Errored(format!("failed to spawn: {}", e)),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => CheckOutcome::Errored(format!("timed out after {}s", timeout.as_secs())),
            Ok(Err(e)) => CheckOutcome::Errored(e.to_string()),
            Ok(Ok(output)) if output.status.success() => CheckOutcome::Passed,
            Ok(Ok(output)) => match output.status.code() {
                Some(127) => CheckOutcome::Errored("command not found".to_string()),
                Some(code) => CheckOutcome::Failed(Some(format!("exit code {}", code))),
                None => CheckOutcome::Failed(Some("terminated by signal".to_string())),
            },
        }
    }

    fn count_glob(&self, pattern: &str, min_count: usize) -> CheckOutcome {
        // Only the check's pattern is a pattern; the workspace path is literal.
        let root = glob::Pattern::escape(&self.workspace.to_string_lossy());
        let full = Path::new(&root).join(pattern);
        let paths = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => return CheckOutcome::Errored(format!("invalid pattern: {}", e)),
        };
        let count = paths.filter_map(Result::ok).count();
        if count >= min_count {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(Some(format!("{} of {} matches", count, min_count)))
        }
    }

    async fn run_review(&self, criteria: &str, files: Option<&[String]>) -> CheckOutcome {
        let Some(reviewer) = &self.reviewer else {
            return CheckOutcome::Errored("no reviewer available".to_string());
        };
        let prompt = review_prompt(self.task_prompt.as_deref(), criteria, files);
        match reviewer.review(&self.workspace, &prompt).await {
            Ok(text) => parse_review(&text),
            Err(e) => CheckOutcome::Errored(format!("Review failed to run: {}", e)),
        }
    }
}

/// `PASS` on the first line passes; otherwise the rest is the reason.
fn parse_review(text: &str) -> CheckOutcome {
    let mut lines = text.trim().lines();
    let first = lines.next().unwrap_or("").trim().to_uppercase();
    if first.starts_with("PASS") {
        return CheckOutcome::Passed;
    }
    let reason: String = lines
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .chars()
        .take(REVIEW_REASON_CHARS)
        .collect();
    CheckOutcome::Failed((!reason.is_empty()).then_some(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeReviewer {
        reply: Result<String, AgentError>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeReviewer {
        fn new(reply: Result<String, AgentError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Reviewer for FakeReviewer {
        async fn review(&self, _workspace: &Path, prompt: &str) -> Result<String, AgentError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone()
        }
    }

    fn command(cmd: &str) -> CompletionCheck {
        CompletionCheck::Command {
            cmd: cmd.to_string(),
            timeout_sec: None,
        }
    }

    #[tokio::test]
    async fn test_command_checks() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = CompletionVerifier::new(dir.path());

        let report = verifier
            .verify(&[command("true"), command("exit 3"), command("definitely-not-a-command-xyz")])
            .await;

        assert_eq!(report.results[0].outcome, CheckOutcome::Passed);
        assert_eq!(
            report.results[1].outcome,
            CheckOutcome::Failed(Some("exit code 3".to_string()))
        );
        assert!(matches!(report.results[2].outcome, CheckOutcome::Errored(_)));
        assert!(!report.all_passed());
        assert_eq!(
            report.summary(),
            "exit 3: exit code 3, error: definitely-not-a-command-xyz: command not found"
        );
    }

    #[tokio::test]
    async fn test_command_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let report = CompletionVerifier::new(dir.path())
            .verify(&[command("test -f marker")])
            .await;
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn test_command_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = CompletionVerifier::new(dir.path())
            .verify(&[CompletionCheck::Command {
                cmd: "sleep 10".to_string(),
                timeout_sec: Some(1),
            }])
            .await;
        assert_eq!(
            report.results[0].outcome,
            CheckOutcome::Errored("timed out after 1s".to_string())
        );
    }

    #[tokio::test]
    async fn test_file_and_glob_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "").unwrap();
        let verifier = CompletionVerifier::new(dir.path());

        let report = verifier
            .verify(&[
                CompletionCheck::FileExists {
                    path: "src/a.rs".to_string(),
                },
                CompletionCheck::FileExists {
                    path: "README.md".to_string(),
                },
                CompletionCheck::GlobExists {
                    pattern: "src/*.rs".to_string(),
                    min_count: 2,
                },
                CompletionCheck::GlobExists {
                    pattern: "src/*.rs".to_string(),
                    min_count: 3,
                },
            ])
            .await;

        let passed: Vec<bool> = report.results.iter().map(|r| r.outcome.is_passed()).collect();
        assert_eq!(passed, vec![true, false, true, false]);
        assert_eq!(
            report.summary(),
            "README.md: not found, src/*.rs: 2 of 3 matches"
        );
    }

    #[tokio::test]
    async fn test_glob_in_workspace_with_pattern_characters() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("task [1]*");
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        std::fs::write(workspace.join("src/lib.rs"), "").unwrap();

        let report = CompletionVerifier::new(&workspace)
            .verify(&[CompletionCheck::GlobExists {
                pattern: "src/*.rs".to_string(),
                min_count: 1,
            }])
            .await;
        assert!(report.all_passed(), "{}", report.summary());
    }

    #[tokio::test]
    async fn test_no_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let report = CompletionVerifier::new(dir.path()).verify(&[]).await;
        assert!(report.all_passed());
        assert_eq!(report.summary(), "");
    }

    #[tokio::test]
    async fn test_review_checks() {
        let dir = tempfile::tempdir().unwrap();
        let check = CompletionCheck::Review {
            prompt: "All public functions are documented".to_string(),
            files: Some(vec!["src/lib.rs".to_string()]),
        };

        let pass = FakeReviewer::new(Ok("pass\nLooks good".to_string()));
        let report = CompletionVerifier::new(dir.path())
            .with_task_prompt("Document the API")
            .with_reviewer(pass.clone())
            .verify(std::slice::from_ref(&check))
            .await;
        assert!(report.all_passed());
        let prompt = pass.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Document the API"));
        assert!(prompt.contains("- src/lib.rs"));

        let fail = FakeReviewer::new(Ok("FAIL\nMissing docs on\nparse()".to_string()));
        let report = CompletionVerifier::new(dir.path())
            .with_reviewer(fail)
            .verify(std::slice::from_ref(&check))
            .await;
        assert_eq!(
            report.results[0].outcome,
            CheckOutcome::Failed(Some("Missing docs on parse()".to_string()))
        );
        assert_eq!(
            report.summary(),
            "review: All public functions are documented: Missing docs on parse()"
        );

        let broken = FakeReviewer::new(Err(AgentError::Failed("network down".to_string())));
        let report = CompletionVerifier::new(dir.path())
            .with_reviewer(broken)
            .verify(&[check])
            .await;
        assert_eq!(
            report.results[0].outcome,
            CheckOutcome::Errored("Review failed to run: network down".to_string())
        );
    }
}
