//! Event log tailer.
//!
//! Polls a task's `events.jsonl` for growth instead of relying on filesystem
//! notifications, which do not reliably cross the container boundary. Only
//! complete, newline-terminated lines past the current byte offset are
//! consumed; a trailing partial line is left for the next poll.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskbox_core::{EventRecord, WorkerEvent};

/// Longest line excerpt carried in a parse error.
const EXCERPT_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("Failed to parse event line: {line}")]
    Parse { line: String },

    #[error("Failed to read event log: {0}")]
    Io(#[from] std::io::Error),
}

pub type TailItem = Result<WorkerEvent, TailerError>;

/// Incremental reader of one event log.
pub struct EventTailer {
    path: PathBuf,
    offset: u64,
}

impl EventTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Byte offset of the first unconsumed line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last poll.
    pub async fn poll(&mut self) -> Vec<TailItem> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => return vec![Err(e.into())],
        };

        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => return vec![Err(e.into())],
        };
        if len < self.offset {
            warn!(path = %self.path.display(), "Event log shrank; rereading from the start");
            self.offset = 0;
        }
        if len == self.offset {
            return Vec::new();
        }

        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        let read = async {
            file.seek(SeekFrom::Start(self.offset)).await?;
            file.read_to_end(&mut buf).await
        };
        if let Err(e) = read.await {
            return vec![Err(e.into())];
        }

        // Stop at the last newline; anything after it is still being written.
        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        self.offset += (end + 1) as u64;

        buf[..end]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line))
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_line(&line))
            .collect()
    }

    /// Poll every `interval` and send items to `sink` until `stop` fires,
    /// then poll one last time.
    pub fn spawn(
        mut self,
        interval: Duration,
        sink: mpsc::UnboundedSender<TailItem>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.cancelled() => break,
                }
                for item in self.poll().await {
                    if sink.send(item).is_err() {
                        return;
                    }
                }
            }
            for item in self.poll().await {
                if sink.send(item).is_err() {
                    return;
                }
            }
            debug!(path = %self.path.display(), offset = self.offset, "Tailer stopped");
        })
    }
}

fn parse_line(line: &str) -> TailItem {
    serde_json::from_str::<EventRecord>(line)
        .map(|record| record.event)
        .map_err(|_| TailerError::Parse {
            line: line.chars().take(EXCERPT_LEN).collect(),
        })
}
