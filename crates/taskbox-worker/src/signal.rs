//! The signal file the agent writes to declare completion or blockage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use taskbox_core::TaskSignal;

use crate::error::WorkerError;

#[derive(Debug, Clone)]
pub struct SignalFile {
    path: PathBuf,
}

impl SignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current recognized signal, if any. Unreadable files count as no signal.
    pub fn read(&self) -> Option<TaskSignal> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| TaskSignal::parse(&content))
    }

    /// Remove the signal; a missing file is already clear.
    pub fn clear(&self) -> Result<(), WorkerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, signal: TaskSignal) -> Result<(), WorkerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", signal))?;
        Ok(())
    }
}
