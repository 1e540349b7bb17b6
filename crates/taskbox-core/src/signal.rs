//! Signal file values.

use std::fmt;

/// A recognized value of the signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    Complete,
    Blocked,
}

impl TaskSignal {
    pub const COMPLETE: &'static str = "TASK_COMPLETE";
    pub const BLOCKED: &'static str = "TASK_BLOCKED";

    /// Parse signal file content; anything other than an exact keyword
    /// (surrounding whitespace aside) is ignored.
    pub fn parse(content: &str) -> Option<Self> {
        match content.trim() {
            Self::COMPLETE => Some(Self::Complete),
            Self::BLOCKED => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => Self::COMPLETE,
            Self::Blocked => Self::BLOCKED,
        }
    }
}

impl fmt::Display for TaskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signals() {
        assert_eq!(TaskSignal::parse("TASK_COMPLETE\n"), Some(TaskSignal::Complete));
        assert_eq!(TaskSignal::parse("  TASK_BLOCKED "), Some(TaskSignal::Blocked));
        assert_eq!(TaskSignal::parse("task_complete"), None);
        assert_eq!(TaskSignal::parse("TASK_COMPLETE please"), None);
        assert_eq!(TaskSignal::parse(""), None);
    }
}
