//! Plain one-line rendering of host events for the CLI.

use taskbox_core::{MessageSource, WorkerEvent};

use crate::events::HostEvent;

/// Render an event as a single line, or `None` when it is not worth printing.
pub fn render(event: &HostEvent) -> Option<String> {
    match event {
        HostEvent::Worker { task_id, event } => Some(format!("[{}] {}", task_id, worker_line(event))),
        HostEvent::TaskUpdated(task) => {
            // Progress folds are reported through the worker events themselves.
            if !task.is_terminal() && task.started_at.is_some() && task.iteration > 0 {
                return None;
            }
            let mut line = format!("[{}] task {}", task.id, task.status);
            if task.is_terminal() {
                line.push_str(&format!(" (cost ${:.2})", task.cost_usd));
            }
            if let Some(error) = &task.error {
                line.push_str(&format!(": {}", error));
            }
            Some(line)
        }
        HostEvent::TailerError { task_id, message } => {
            Some(format!("[{}] unreadable event: {}", task_id, message))
        }
        HostEvent::BranchCreated { task_id, branch } => {
            Some(format!("[{}] results on branch {}", task_id, branch))
        }
    }
}

fn worker_line(event: &WorkerEvent) -> String {
    match event {
        WorkerEvent::IterationStart {
            iteration,
            max_iterations,
            fresh,
        } => {
            let context = if *fresh { "fresh" } else { "resumed" };
            format!("iteration {}/{} ({})", iteration, max_iterations, context)
        }
        WorkerEvent::IterationEnd {
            iteration,
            cost_usd,
            duration_ms,
            num_turns,
        } => format!(
            "iteration {} done: {} turns, ${:.2}, {:.1}s",
            iteration,
            num_turns,
            cost_usd,
            *duration_ms as f64 / 1000.0
        ),
        WorkerEvent::Message { source, text } => {
            let tag = match source {
                MessageSource::Agent => "agent",
                MessageSource::Tool => "tool",
                MessageSource::System => "system",
            };
            format!("{}: {}", tag, text.replace('\n', " "))
        }
        WorkerEvent::Error {
            iteration,
            error,
            backoff_ms,
        } => match backoff_ms {
            Some(ms) => format!("error in iteration {}: {} (retry in {}ms)", iteration, error, ms),
            None => format!("error in iteration {}: {}", iteration, error),
        },
        WorkerEvent::Signal { signal } => format!("signal {}", signal),
        WorkerEvent::Completion {
            all_passed,
            summary,
        } => {
            if *all_passed {
                "completion checks passed".to_string()
            } else {
                format!("completion checks failed: {}", summary)
            }
        }
        WorkerEvent::Stagnation {
            stagnant_count,
            threshold,
        } => format!("no progress ({}/{})", stagnant_count, threshold),
        WorkerEvent::Timeout => "time limit reached".to_string(),
        WorkerEvent::Done {
            status,
            iterations,
            total_cost_usd,
        } => format!(
            "done: {} after {} iterations, ${:.2}",
            status, iterations, total_cost_usd
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use taskbox_core::{LoopStatus, NewTask, Task, TaskId, TaskStatus};

    fn id() -> TaskId {
        TaskId::new("abc123")
    }

    fn worker(event: WorkerEvent) -> Option<String> {
        render(&HostEvent::Worker {
            task_id: id(),
            event,
        })
    }

    #[test]
    fn test_worker_events() {
        assert_eq!(
            worker(WorkerEvent::IterationStart {
                iteration: 2,
                max_iterations: 10,
                fresh: false,
            })
            .unwrap(),
            "[abc123] iteration 2/10 (resumed)"
        );
        assert_eq!(
            worker(WorkerEvent::message(MessageSource::Agent, "line one\nline two")).unwrap(),
            "[abc123] agent: line one line two"
        );
        assert_eq!(
            worker(WorkerEvent::Done {
                status: LoopStatus::Blocked,
                iterations: 3,
                total_cost_usd: 1.5,
            })
            .unwrap(),
            "[abc123] done: blocked after 3 iterations, $1.50"
        );
        assert_eq!(
            worker(WorkerEvent::Error {
                iteration: 1,
                error: "boom".to_string(),
                backoff_ms: Some(2000),
            })
            .unwrap(),
            "[abc123] error in iteration 1: boom (retry in 2000ms)"
        );
    }

    #[test]
    fn test_task_updates() {
        let mut task = Task::new(id(), NewTask::new("p", "/src"), PathBuf::from("/logs"));
        assert_eq!(
            render(&HostEvent::TaskUpdated(task.clone())).unwrap(),
            "[abc123] task pending"
        );

        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        task.iteration = 2;
        assert!(render(&HostEvent::TaskUpdated(task.clone())).is_none());

        task.status = TaskStatus::Failed;
        task.cost_usd = 0.75;
        task.error = Some("Worker exited with code 1".to_string());
        assert_eq!(
            render(&HostEvent::TaskUpdated(task)).unwrap(),
            "[abc123] task failed (cost $0.75): Worker exited with code 1"
        );
    }
}
