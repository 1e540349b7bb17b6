//! Iteration state persistence (`<log dir>/state.json`).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use taskbox_core::IterationState;
use tracing::{info, warn};

use crate::error::WorkerError;

/// Location of the persisted [`IterationState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state for a task, or start fresh.
    ///
    /// A missing file, a file that fails to parse, or a file written for a
    /// different prompt all yield fresh state stamped with `now`.
    pub fn load_or_fresh(&self, prompt_digest: &str, now: DateTime<Utc>) -> IterationState {
        let fresh = || IterationState::fresh(now, Some(prompt_digest.to_string()));

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return fresh(),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Unreadable state file, starting fresh");
                return fresh();
            }
        };

        match serde_json::from_str::<IterationState>(&raw) {
            Ok(state) if state.belongs_to(Some(prompt_digest)) => {
                info!(
                    iteration = state.iteration,
                    session_id = ?state.session_id,
                    status = %state.status,
                    "Resuming from saved state"
                );
                state
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "State file belongs to another prompt, starting fresh");
                fresh()
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Corrupt state file, starting fresh");
                fresh()
            }
        }
    }

    /// Atomically write the state (temp file + rename).
    pub fn save(&self, state: &IterationState) -> Result<(), WorkerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
