//! Persisted iteration state for one task's agent loop.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::LoopStatus;

/// Base delay for retrying a failed agent invocation.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for the retry delay.
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// A failed iteration and its error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub iteration: u32,
    pub error: String,
}

/// Resumable progress record (`<log dir>/state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationState {
    /// Agent session to resume; `None` forces a fresh context.
    pub session_id: Option<String>,
    /// Number of iterations started so far.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub status: LoopStatus,
    /// Context compactions observed since the last fork.
    pub compactions: u32,
    #[serde(default)]
    pub errors: Vec<IterationError>,
    /// Digest of the progress artifact at the last iteration boundary.
    pub progress_hash: Option<String>,
    pub stagnant_count: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Digest of the prompt this state was created for.
    #[serde(default)]
    pub prompt_digest: Option<String>,
}

impl IterationState {
    /// Fresh state for a task that has never run.
    pub fn fresh(started_at: DateTime<Utc>, prompt_digest: Option<String>) -> Self {
        Self {
            session_id: None,
            iteration: 0,
            started_at,
            status: LoopStatus::Running,
            compactions: 0,
            errors: Vec::new(),
            progress_hash: None,
            stagnant_count: 0,
            total_cost_usd: 0.0,
            prompt_digest,
        }
    }

    /// Whether this state can be resumed for a task with the given prompt digest.
    pub fn belongs_to(&self, prompt_digest: Option<&str>) -> bool {
        match (self.prompt_digest.as_deref(), prompt_digest) {
            (Some(stored), Some(current)) => stored == current,
            _ => true,
        }
    }

    /// Fold the current progress-artifact digest into the stagnation counter.
    ///
    /// A missing artifact is never stagnant. The counter resets whenever the
    /// digest changes.
    pub fn observe_progress(&mut self, digest: Option<String>) {
        match digest {
            None => {
                self.stagnant_count = 0;
                self.progress_hash = None;
            }
            Some(digest) => {
                if self.progress_hash.as_deref() == Some(digest.as_str()) {
                    self.stagnant_count += 1;
                } else {
                    self.stagnant_count = 0;
                }
                self.progress_hash = Some(digest);
            }
        }
    }

    pub fn is_stagnant(&self, threshold: u32) -> bool {
        self.stagnant_count >= threshold
    }

    /// Whether `now` is past the wall-clock deadline of `max_hours`.
    pub fn is_timed_out(&self, max_hours: f64, now: DateTime<Utc>) -> bool {
        let limit_ms = (max_hours * 3_600_000.0).max(0.0);
        let elapsed = now - self.started_at;
        elapsed >= Duration::milliseconds(limit_ms as i64)
    }

    /// Record a failed invocation and drop the session so the retry starts fresh.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(IterationError {
            iteration: self.iteration,
            error: error.into(),
        });
        self.session_id = None;
    }

    /// Retry delay after the most recent error: 1s, 2s, 4s, ... capped at 30s.
    pub fn backoff_ms(&self) -> u64 {
        let exponent = self.errors.len().saturating_sub(1).min(16) as u32;
        BACKOFF_BASE_MS
            .saturating_mul(1u64 << exponent)
            .min(BACKOFF_CAP_MS)
    }

    /// Add an iteration's cost; negative values are ignored.
    pub fn add_cost(&mut self, cost_usd: f64) {
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.total_cost_usd += cost_usd;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> IterationState {
        IterationState::fresh(Utc::now(), Some("abc".to_string()))
    }

    #[test]
    fn test_stagnation_counts_identical_digests() {
        let mut s = state();
        s.observe_progress(Some("h1".to_string()));
        assert_eq!(s.stagnant_count, 0);
        s.observe_progress(Some("h1".to_string()));
        s.observe_progress(Some("h1".to_string()));
        s.observe_progress(Some("h1".to_string()));
        assert_eq!(s.stagnant_count, 3);
        assert!(s.is_stagnant(3));
    }

    #[test]
    fn test_stagnation_resets_on_change_and_missing_file() {
        let mut s = state();
        s.observe_progress(Some("h1".to_string()));
        s.observe_progress(Some("h1".to_string()));
        s.observe_progress(Some("h1".to_string()));
        s.observe_progress(Some("h2".to_string()));
        assert_eq!(s.stagnant_count, 0);
        assert_eq!(s.progress_hash.as_deref(), Some("h2"));

        s.observe_progress(Some("h2".to_string()));
        s.observe_progress(None);
        assert_eq!(s.stagnant_count, 0);
        assert!(s.progress_hash.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut s = state();
        let mut delays = Vec::new();
        for i in 0..7 {
            s.record_error(format!("boom {}", i));
            delays.push(s.backoff_ms());
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_record_error_clears_session() {
        let mut s = state();
        s.session_id = Some("sess".to_string());
        s.iteration = 4;
        s.record_error("network");
        assert!(s.session_id.is_none());
        assert_eq!(s.errors[0].iteration, 4);
    }

    #[test]
    fn test_timeout_uses_elapsed_hours() {
        let start = Utc::now();
        let s = IterationState::fresh(start, None);
        assert!(!s.is_timed_out(1.0, start + Duration::minutes(59)));
        assert!(s.is_timed_out(1.0, start + Duration::minutes(60)));
    }

    #[test]
    fn test_belongs_to_prompt() {
        let s = state();
        assert!(s.belongs_to(Some("abc")));
        assert!(!s.belongs_to(Some("other")));
        assert!(s.belongs_to(None));
    }

    #[test]
    fn test_json_round_trip() {
        let mut s = state();
        s.session_id = Some("sess-1".to_string());
        s.iteration = 7;
        s.compactions = 2;
        s.record_error("flaky");
        s.session_id = Some("sess-2".to_string());
        s.observe_progress(Some("digest".to_string()));
        s.add_cost(1.5);

        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"stagnantCount\""));
        let back: IterationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
