//! The iteration loop.
//!
//! Drives one task through repeated bounded agent invocations until it
//! completes, blocks, stagnates, or runs out of iterations, time or budget.
//! State is persisted after every step so a restarted worker resumes where
//! the previous one stopped. Exactly one `done` event is emitted per run.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskbox_core::{IterationState, LoopStatus, TaskSignal, WorkerEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentRequest};
use crate::clock::{Clock, SystemClock};
use crate::completion::CompletionVerifier;
use crate::config::WorkerConfig;
use crate::error::{AgentError, WorkerError};
use crate::event_log::EventLog;
use crate::progress::{self, ProgressFile};
use crate::prompt::{fresh_prompt, CONTINUE_PROMPT, SYSTEM_APPEND};
use crate::signal::SignalFile;
use crate::state::StateFile;

/// Identical progress digests in a row that count as stagnation.
pub const STAGNATION_THRESHOLD: u32 = 3;

/// Compactions after which a resumed session is forked.
pub const FORK_AFTER_COMPACTIONS: u32 = 3;

/// Abort control shared with signal handlers.
///
/// `abort_iteration` interrupts the in-flight agent invocation only;
/// `shutdown` also ends the loop.
#[derive(Clone, Default)]
pub struct AbortHandle {
    shutdown: CancellationToken,
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort_iteration(&self) {
        info!("Aborting current agent invocation");
        self.lock_current().cancel();
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token for the next invocation; cancelled by either control.
    fn next_iteration(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        *self.lock_current() = token.clone();
        token
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One task's agent loop.
pub struct IterationLoop {
    config: WorkerConfig,
    agent: Arc<dyn Agent>,
    verifier: CompletionVerifier,
    events: EventLog,
    state_file: StateFile,
    signal: SignalFile,
    progress: ProgressFile,
    clock: Arc<dyn Clock>,
    abort: AbortHandle,
}

impl IterationLoop {
    pub fn new(
        config: WorkerConfig,
        agent: Arc<dyn Agent>,
        verifier: CompletionVerifier,
        events: EventLog,
    ) -> Self {
        let paths = &config.paths;
        Self {
            state_file: StateFile::new(&paths.state_file),
            signal: SignalFile::new(&paths.signal_file),
            progress: ProgressFile::new(&paths.progress_file),
            config,
            agent,
            verifier,
            events,
            clock: Arc::new(SystemClock),
            abort: AbortHandle::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run the loop to a terminal status.
    ///
    /// Never fails: errors escaping the loop are recorded, the status is
    /// forced to `failed`, and `done` is still emitted.
    pub async fn run(&self) -> LoopStatus {
        let digest = progress::digest(&self.config.prompt);
        let mut state = self.state_file.load_or_fresh(&digest, self.clock.now());

        if state.status.is_terminal() {
            info!(status = %state.status, "Task already finished in a previous run");
        } else if let Err(e) = self.drive(&mut state).await {
            error!(error = %e, iteration = state.iteration, "Iteration loop failed");
            self.events.emit(WorkerEvent::Error {
                iteration: state.iteration,
                error: format!("Fatal: {}", e),
                backoff_ms: None,
            });
            state.status = LoopStatus::Failed;
            self.persist(&state);
        }

        info!(
            status = %state.status,
            iterations = state.iteration,
            total_cost_usd = state.total_cost_usd,
            "Iteration loop finished"
        );
        self.events.emit(WorkerEvent::Done {
            status: state.status,
            iterations: state.iteration,
            total_cost_usd: state.total_cost_usd,
        });
        state.status
    }

    async fn drive(&self, state: &mut IterationState) -> Result<(), WorkerError> {
        let limits = &self.config.limits;
        std::fs::create_dir_all(&self.config.paths.state_dir)?;

        loop {
            if self.abort.is_shutdown() {
                self.events.emit(WorkerEvent::system("Shutdown requested, stopping"));
                break;
            }
            if state.iteration >= limits.max_iterations
                || state.is_timed_out(limits.max_hours, self.clock.now())
            {
                break;
            }
            if state.total_cost_usd >= limits.max_budget_usd {
                self.events.emit(WorkerEvent::system(format!(
                    "Budget of ${:.2} reached (spent ${:.2})",
                    limits.max_budget_usd, state.total_cost_usd
                )));
                break;
            }

            state.iteration += 1;
            state.status = LoopStatus::Running;
            self.state_file.save(state)?;
            self.signal.clear()?;

            let fresh = self.config.fresh_context || state.session_id.is_none();
            let fork = !fresh && state.compactions > FORK_AFTER_COMPACTIONS;
            if fork {
                info!(compactions = state.compactions, "Forking session");
                self.events.emit(WorkerEvent::system(format!(
                    "Forking session after {} compactions",
                    state.compactions
                )));
                state.compactions = 0;
            }

            info!(iteration = state.iteration, fresh, fork, "Starting iteration");
            self.events.emit(WorkerEvent::IterationStart {
                iteration: state.iteration,
                max_iterations: limits.max_iterations,
                fresh,
            });

            let request = AgentRequest {
                prompt: if fresh {
                    fresh_prompt(&self.config.prompt)
                } else {
                    CONTINUE_PROMPT.to_string()
                },
                resume: if fresh { None } else { state.session_id.clone() },
                fork_session: fork,
                max_turns: limits.turns_per_iteration,
                max_budget_usd: (limits.max_budget_usd - state.total_cost_usd).max(0.0),
                append_system_prompt: SYSTEM_APPEND.to_string(),
                mcp_config: self.config.paths.mcp_config().map(|p| p.to_path_buf()),
            };

            let started = Instant::now();
            let token = self.abort.next_iteration();
            let invocation = self.agent.invoke(request, &self.events, token).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match invocation {
                Ok(outcome) => {
                    if outcome.session_id.is_some() {
                        state.session_id = outcome.session_id;
                    }
                    state.compactions += outcome.compactions;
                    state.add_cost(outcome.cost_usd);
                    self.events.emit(WorkerEvent::IterationEnd {
                        iteration: state.iteration,
                        cost_usd: outcome.cost_usd,
                        duration_ms,
                        num_turns: outcome.num_turns,
                    });
                }
                Err(AgentError::Aborted) => {
                    info!(iteration = state.iteration, "Iteration aborted");
                    self.events.emit(WorkerEvent::IterationEnd {
                        iteration: state.iteration,
                        cost_usd: 0.0,
                        duration_ms,
                        num_turns: 0,
                    });
                    self.state_file.save(state)?;
                    continue;
                }
                Err(AgentError::Failed(message)) => {
                    state.record_error(message.clone());
                    self.state_file.save(state)?;
                    let backoff_ms = state.backoff_ms();
                    warn!(
                        iteration = state.iteration,
                        error = %message,
                        backoff_ms,
                        "Agent invocation failed"
                    );
                    self.events.emit(WorkerEvent::Error {
                        iteration: state.iteration,
                        error: message,
                        backoff_ms: Some(backoff_ms),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = self.abort.shutdown.cancelled() => {}
                    }
                    continue;
                }
            }

            match self.signal.read() {
                Some(TaskSignal::Complete) => {
                    self.events.emit(WorkerEvent::Signal {
                        signal: TaskSignal::COMPLETE.to_string(),
                    });
                    if self.config.checks.is_empty() {
                        state.status = LoopStatus::Completed;
                        self.state_file.save(state)?;
                        break;
                    }
                    let report = self.verifier.verify(&self.config.checks).await;
                    self.events.emit(WorkerEvent::Completion {
                        all_passed: report.all_passed(),
                        summary: report.summary(),
                    });
                    if report.all_passed() {
                        state.status = LoopStatus::Completed;
                        self.state_file.save(state)?;
                        break;
                    }
                    info!(summary = %report.summary(), "Completion checks failed, continuing");
                    self.signal.clear()?;
                }
                Some(TaskSignal::Blocked) => {
                    self.events.emit(WorkerEvent::Signal {
                        signal: TaskSignal::BLOCKED.to_string(),
                    });
                    state.status = LoopStatus::Blocked;
                    self.state_file.save(state)?;
                    break;
                }
                None => {}
            }

            state.observe_progress(self.progress.digest());
            if state.is_stagnant(STAGNATION_THRESHOLD) {
                warn!(stagnant_count = state.stagnant_count, "Progress stagnated");
                self.events.emit(WorkerEvent::Stagnation {
                    stagnant_count: state.stagnant_count,
                    threshold: STAGNATION_THRESHOLD,
                });
                state.status = LoopStatus::Failed;
                self.state_file.save(state)?;
                break;
            }

            self.state_file.save(state)?;
        }

        if state.status == LoopStatus::Running {
            state.status = LoopStatus::Failed;
            if state.is_timed_out(limits.max_hours, self.clock.now()) {
                self.events.emit(WorkerEvent::Timeout);
            }
            self.state_file.save(state)?;
        }
        Ok(())
    }

    fn persist(&self, state: &IterationState) {
        if let Err(e) = self.state_file.save(state) {
            warn!(error = %e, "Failed to persist final state");
        }
    }
}
