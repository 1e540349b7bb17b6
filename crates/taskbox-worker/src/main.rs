//! TaskBox worker daemon

use std::sync::Arc;

use clap::Parser;
use taskbox_claude_sdk::ClaudeExecutor;
use taskbox_core::{IterationState, LoopStatus, WorkerEvent};
use taskbox_worker::state::StateFile;
use taskbox_worker::{
    AbortHandle, ClaudeAgent, ClaudeReviewer, CompletionVerifier, EventLog, IterationLoop,
    WorkerArgs, WorkerError,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // stdout is reserved for the container's own output; log to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let status = match run(WorkerArgs::parse()).await {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "Worker failed to start");
            LoopStatus::Failed
        }
    };
    std::process::exit(status.exit_code());
}

async fn run(args: WorkerArgs) -> Result<LoopStatus, WorkerError> {
    let config = args.into_config()?;
    config.paths.ensure_dirs()?;

    info!(
        workspace = %config.paths.workspace.display(),
        max_iterations = config.limits.max_iterations,
        max_hours = config.limits.max_hours,
        max_budget_usd = config.limits.max_budget_usd,
        checks = config.checks.len(),
        "Starting TaskBox worker"
    );

    let mut executor = ClaudeExecutor::new(&config.claude_path);
    if let Some(model) = &config.model {
        executor = executor.with_model(model);
    }

    let events = EventLog::open(&config.paths.events_file)?;
    let agent = ClaudeAgent::new(executor.clone(), &config.paths);
    let verifier = CompletionVerifier::new(&config.paths.workspace)
        .with_task_prompt(&config.prompt)
        .with_reviewer(Arc::new(ClaudeReviewer::new(executor)));

    let state_file = StateFile::new(&config.paths.state_file);
    let iteration_loop = IterationLoop::new(config, Arc::new(agent), verifier, events.clone());
    install_signal_handlers(iteration_loop.abort_handle())?;

    let handle = tokio::spawn(async move { iteration_loop.run().await });
    match handle.await {
        Ok(status) => Ok(status),
        Err(e) => {
            // The loop died before emitting `done`; report from the last saved state.
            error!(error = %e, "Iteration loop panicked");
            let state: Option<IterationState> = std::fs::read_to_string(state_file.path())
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());
            let (iterations, total_cost_usd) = state
                .map(|s| (s.iteration, s.total_cost_usd))
                .unwrap_or_default();
            events.emit(WorkerEvent::Error {
                iteration: iterations,
                error: format!("Fatal: {}", e),
                backoff_ms: None,
            });
            events.emit(WorkerEvent::Done {
                status: LoopStatus::Failed,
                iterations,
                total_cost_usd,
            });
            Ok(LoopStatus::Failed)
        }
    }
}

/// SIGUSR1 aborts the current agent invocation; SIGTERM and SIGINT stop the loop.
fn install_signal_handlers(abort: AbortHandle) -> Result<(), WorkerError> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let on_usr1 = abort.clone();
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("Received SIGUSR1");
            on_usr1.abort_iteration();
        }
    });
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("Received SIGTERM"),
            _ = int.recv() => info!("Received SIGINT"),
        }
        abort.shutdown();
    });
    Ok(())
}
