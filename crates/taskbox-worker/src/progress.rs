//! Progress artifact hashing for stagnation detection.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes.
pub fn digest(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// The progress file the agent keeps updated. Only its digest is inspected.
#[derive(Debug, Clone)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digest of the current content; `None` when the file does not exist.
    pub fn digest(&self) -> Option<String> {
        std::fs::read(&self.path).ok().map(digest)
    }
}
