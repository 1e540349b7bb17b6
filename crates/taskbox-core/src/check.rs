//! Completion checks shared between host and worker.
//!
//! The host serializes the task's check list to JSON and passes it on the
//! container command line; the worker parses it back and runs the checks
//! before trusting a `TASK_COMPLETE` signal.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Default timeout for command checks, in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// A single verification strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionCheck {
    /// Run a shell command in the workspace; passes on exit status 0.
    Command {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_sec: Option<u64>,
    },

    /// Passes when the path exists (relative paths resolve against the workspace).
    FileExists { path: String },

    /// Passes when the pattern matches at least `min_count` paths.
    GlobExists { pattern: String, min_count: usize },

    /// AI review against natural-language criteria.
    Review {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<String>>,
    },
}

impl CompletionCheck {
    /// Short human-readable identifier used in summaries.
    pub fn id(&self) -> String {
        match self {
            Self::Command { cmd, .. } => cmd.clone(),
            Self::FileExists { path } => path.clone(),
            Self::GlobExists { pattern, .. } => pattern.clone(),
            Self::Review { prompt, .. } => {
                let head: String = prompt.chars().take(60).collect();
                format!("review: {}", head)
            }
        }
    }

    /// Timeout for command checks, falling back to the default.
    pub fn timeout_secs(&self) -> Option<u64> {
        match self {
            Self::Command { timeout_sec, .. } => {
                Some(timeout_sec.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS))
            }
            _ => None,
        }
    }

    /// Parse a JSON-encoded check list (the container launch format).
    pub fn parse_list(json: &str) -> Result<Vec<CompletionCheck>, CoreError> {
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(json)?)
    }

    /// Encode a check list for the container command line.
    pub fn encode_list(checks: &[CompletionCheck]) -> Result<String, CoreError> {
        Ok(serde_json::to_string(checks)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_format() {
        let json = r#"[
            {"type":"command","cmd":"cargo test","timeout_sec":60},
            {"type":"file_exists","path":"README.md"},
            {"type":"glob_exists","pattern":"src/**/*.rs","min_count":2},
            {"type":"review","prompt":"Code is idiomatic","files":["src/lib.rs"]}
        ]"#;
        let checks = CompletionCheck::parse_list(json).unwrap();

        assert_eq!(checks.len(), 4);
        assert_eq!(
            checks[0],
            CompletionCheck::Command {
                cmd: "cargo test".to_string(),
                timeout_sec: Some(60),
            }
        );
        assert!(matches!(
            &checks[2],
            CompletionCheck::GlobExists { min_count: 2, .. }
        ));
    }

    #[test]
    fn test_empty_list_is_allowed() {
        assert!(CompletionCheck::parse_list("").unwrap().is_empty());
        assert!(CompletionCheck::parse_list("[]").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = CompletionCheck::parse_list("[{\"type\":\"nope\"}]").unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
        assert!(CompletionCheck::parse_list("not json").is_err());
    }

    #[test]
    fn test_ids_and_default_timeout() {
        let cmd = CompletionCheck::Command {
            cmd: "make check".to_string(),
            timeout_sec: None,
        };
        assert_eq!(cmd.id(), "make check");
        assert_eq!(cmd.timeout_secs(), Some(DEFAULT_COMMAND_TIMEOUT_SECS));

        let review = CompletionCheck::Review {
            prompt: "x".repeat(100),
            files: None,
        };
        assert_eq!(review.id(), format!("review: {}", "x".repeat(60)));
        assert_eq!(review.timeout_secs(), None);
    }

    #[test]
    fn test_encode_omits_absent_options() {
        let encoded = CompletionCheck::encode_list(&[CompletionCheck::Command {
            cmd: "true".to_string(),
            timeout_sec: None,
        }])
        .unwrap();
        assert_eq!(encoded, r#"[{"type":"command","cmd":"true"}]"#);
    }
}
