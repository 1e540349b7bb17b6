//! JSONL event log writer.
//!
//! Each event is appended as one complete line, so a reader on the other side
//! of the container boundary only ever sees whole records or a trailing
//! partial line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use taskbox_core::{EventRecord, WorkerEvent};
use tracing::{debug, warn};

/// Append-only writer for `events.jsonl`. Cheap to clone.
#[derive(Clone)]
pub struct EventLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl EventLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event. Write failures are logged, never propagated.
    pub fn emit(&self, event: WorkerEvent) {
        debug!(event = event.kind(), "Worker event");
        let line = match EventRecord::now(event).to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize worker event");
                return;
            }
        };

        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!(error = %e, path = %self.path.display(), "Failed to append worker event");
        }
    }

    /// Read every complete record back. Unparseable lines are skipped.
    pub fn read_all(path: &Path) -> std::io::Result<Vec<EventRecord>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskbox_core::MessageSource;

    #[test]
    fn test_events_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let log = EventLog::open(&path).unwrap();

        log.emit(WorkerEvent::IterationStart {
            iteration: 1,
            max_iterations: 10,
            fresh: true,
        });
        log.emit(WorkerEvent::message(MessageSource::Agent, "hello"));
        log.clone().emit(WorkerEvent::Timeout);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.lines().count(), 3);

        let kinds: Vec<_> = EventLog::read_all(&path)
            .unwrap()
            .into_iter()
            .map(|r| r.event.kind())
            .collect();
        assert_eq!(kinds, vec!["iteration:start", "message", "timeout"]);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        EventLog::open(&path).unwrap().emit(WorkerEvent::Timeout);
        EventLog::open(&path).unwrap().emit(WorkerEvent::Timeout);
        assert_eq!(EventLog::read_all(&path).unwrap().len(), 2);
    }
}
