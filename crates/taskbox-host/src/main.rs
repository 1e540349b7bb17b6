//! TaskBox host CLI

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskbox_core::{CompletionCheck, NewTask, TaskId, TaskStatus};
use taskbox_host::render::render;
use taskbox_host::taskfile::LimitOverrides;
use taskbox_host::{
    ContainerRuntime, DockerCli, GitWorkspaces, HostConfig, HostEvent, RunnerTiming, Scheduler,
    SqliteTaskStore, TaskFile, TaskRunner, TaskStore, Workspaces,
};
use taskbox_host::runner::recover_interrupted;

/// TaskBox - run AI coding agents on isolated copies of a repository
#[derive(Parser)]
#[command(name = "taskbox")]
#[command(about = "Run autonomous agent tasks in containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task and follow it until it finishes
    Run(RunArgs),

    /// Remove workspaces and containers left behind by earlier runs
    Prune,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Task prompt (overrides the task file's prompt)
    prompt: Option<String>,

    /// Source repository (defaults to the task file's project, then the current directory)
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// TOML task definition
    #[arg(short = 'f', long)]
    task_file: Option<PathBuf>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    max_hours: Option<f64>,

    #[arg(long = "max-budget")]
    max_budget_usd: Option<f64>,

    #[arg(long)]
    turns_per_iteration: Option<u32>,

    /// Start every iteration with a fresh agent context
    #[arg(long)]
    fresh_context: bool,

    /// Shell command that must exit 0 before the task counts as complete (repeatable)
    #[arg(long = "completion-cmd")]
    completion_cmds: Vec<String>,

    /// Criteria an AI reviewer must accept before the task counts as complete (repeatable)
    #[arg(long = "completion-review")]
    completion_reviews: Vec<String>,

    /// Maximum number of concurrently running tasks
    #[arg(long, env = "TASKBOX_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,
}

impl RunArgs {
    fn limit_overrides(&self) -> LimitOverrides {
        LimitOverrides {
            max_iterations: self.max_iterations,
            max_hours: self.max_hours,
            max_budget_usd: self.max_budget_usd,
            turns_per_iteration: self.turns_per_iteration,
        }
    }

    async fn into_new_task(self) -> Result<NewTask, Box<dyn std::error::Error>> {
        let project = self.project.clone().map(absolute).transpose()?;

        let mut task = match &self.task_file {
            Some(path) => TaskFile::load(path).await?.into_new_task(path, project)?,
            None => {
                let prompt = self.prompt.clone().ok_or("a prompt or --task-file is required")?;
                let project = match project {
                    Some(p) => p,
                    None => std::env::current_dir()?,
                };
                NewTask::new(prompt, project)
            }
        };

        if let Some(prompt) = &self.prompt {
            task.prompt = prompt.clone();
        }
        task.project_dir = absolute(task.project_dir)?;
        self.limit_overrides().apply(&mut task.limits);
        if self.fresh_context {
            task.fresh_context = true;
        }
        for cmd in self.completion_cmds {
            task = task.with_check(CompletionCheck::Command {
                cmd,
                timeout_sec: None,
            });
        }
        for prompt in self.completion_reviews {
            task = task.with_check(CompletionCheck::Review {
                prompt,
                files: None,
            });
        }
        Ok(task)
    }
}

fn absolute(path: PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Long-lived host components.
struct Host {
    config: HostConfig,
    store: Arc<SqliteTaskStore>,
    workspaces: Arc<GitWorkspaces>,
    containers: Arc<DockerCli>,
}

impl Host {
    async fn open(config: HostConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let paths = config.paths();
        paths.ensure_dirs()?;
        let store = Arc::new(SqliteTaskStore::open(&paths.logs, &paths.tasks_db).await?);
        Ok(Self {
            workspaces: Arc::new(GitWorkspaces::new(&paths.workspaces)),
            containers: Arc::new(DockerCli::from_config(&config)),
            store,
            config,
        })
    }

    /// Fail tasks a dead host left running, then remove workspaces and
    /// containers no non-terminal task owns.
    async fn prune(&self) -> (usize, usize) {
        let recovered = recover_interrupted(self.store.as_ref(), self.containers.as_ref()).await;
        if recovered > 0 {
            info!(recovered, "Marked interrupted tasks as failed");
        }

        let keep: HashSet<TaskId> = self
            .store
            .list(None)
            .await
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id)
            .collect();

        let workspaces = match self.workspaces.prune_orphans(&keep).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to prune workspaces");
                0
            }
        };
        let containers = match self.containers.prune_orphans(&keep).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to prune containers");
                0
            }
        };
        (workspaces, containers)
    }

    fn scheduler(&self) -> Scheduler {
        let events = taskbox_host::events::channel();
        let runner = TaskRunner::new(
            self.store.clone(),
            self.workspaces.clone(),
            self.containers.clone(),
            events.clone(),
        )
        .with_timing(RunnerTiming {
            tail_interval: self.config.tail_interval,
            drain_grace: self.config.drain_grace,
        });
        Scheduler::new(
            self.store.clone(),
            Arc::new(runner),
            events,
            self.config.max_concurrent,
            self.config.shutdown_grace,
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the event stream; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let mut config = HostConfig::from_env()?;

    match cli.command {
        Commands::Run(args) => {
            if let Some(n) = args.max_concurrent {
                config.max_concurrent = n.max(1);
            }
            let task = args.into_new_task().await?;
            let status = run_task(Host::open(config).await?, task).await?;
            std::process::exit(exit_code(status));
        }
        Commands::Prune => {
            let host = Host::open(config).await?;
            let (workspaces, containers) = host.prune().await;
            println!(
                "Removed {} workspace(s) and {} container(s)",
                workspaces, containers
            );
        }
    }

    Ok(())
}

async fn run_task(host: Host, input: NewTask) -> Result<TaskStatus, Box<dyn std::error::Error>> {
    host.prune().await;
    host.containers.ensure_image().await?;

    let scheduler = host.scheduler();
    let mut rx = scheduler.subscribe();
    scheduler.start().await;

    let task = scheduler.enqueue(input).await?;
    info!(
        task_id = %task.id,
        project = %task.project_dir.display(),
        base = %host.config.base_dir.display(),
        "Task submitted"
    );

    let status = loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = scheduler.stopped() => break current_status(&host, &task.id).await,
        };
        match event {
            Ok(event) => {
                if let Some(line) = render(&event) {
                    println!("{}", line);
                }
                if let HostEvent::TaskUpdated(t) = &event {
                    if t.id == task.id && t.is_terminal() {
                        break t.status;
                    }
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
            Err(RecvError::Closed) => break current_status(&host, &task.id).await,
        }
    };

    scheduler.shutdown().await;
    print_location(&host.config.paths().task_log_dir(&task.id));
    Ok(status)
}

async fn current_status(host: &Host, id: &TaskId) -> TaskStatus {
    host.store
        .get(id)
        .await
        .map(|t| t.status)
        .unwrap_or(TaskStatus::Failed)
}

fn print_location(log_dir: &Path) {
    println!("Logs: {}", log_dir.display());
}

fn exit_code(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Completed => 0,
        TaskStatus::Blocked => 2,
        _ => 1,
    }
}
