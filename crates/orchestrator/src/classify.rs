//! Failure classification: retryable vs terminal, by message substring.
//!
//! The taxonomy is textually encoded as two ordered lists held as data, so
//! operators can extend classification without code changes. Matching is
//! case-insensitive; a message matching both lists is terminal.

use serde::{Deserialize, Serialize};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; a retry may succeed.
    Retryable,

    /// Permanent; retrying will not help.
    Terminal,
}

impl FailureKind {
    /// Quarantine priority for this kind of failure.
    pub fn priority(&self) -> Priority {
        match self {
            FailureKind::Retryable => Priority::High,
            FailureKind::Terminal => Priority::Normal,
        }
    }

    /// Whether an operator retry is expected to succeed.
    pub fn can_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

/// Operator triage priority of a quarantined failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    /// Returns the priority name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            _ => Err(()),
        }
    }
}

/// Substring tables classifying a failure message.
///
/// Terminal wins when both lists match; a message matching neither is
/// treated as terminal, since an unknown failure is not retried on faith.
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    retryable: Vec<String>,
    terminal: Vec<String>,
}

/// Saga-level retryable terms: transient infrastructure trouble plus the
/// two orchestrator conditions that resolve themselves (a lock held by
/// another saga, a step missing until the next deploy).
const SAGA_RETRYABLE: &[&str] = &[
    "connection refused",
    "connect",
    "timeout",
    "timed out",
    "step function not found",
    "other transaction",
    "cache connection",
    "service unavailable",
];

const SAGA_TERMINAL: &[&str] = &[
    "duplicate",
    "insufficient",
    "already",
    "invalid",
    "permission denied",
];

const COMPENSATION_RETRYABLE: &[&str] = &[
    "connection refused",
    "timeout",
    "timed out",
    "lock wait timeout",
    "connection lost",
    "service unavailable",
    "cache connection",
];

const COMPENSATION_TERMINAL: &[&str] = &[
    "not found",
    "invalid",
    "permission denied",
    "constraint",
];

impl ClassificationTable {
    /// Builds a table from explicit term lists.
    pub fn new(retryable: Vec<String>, terminal: Vec<String>) -> Self {
        Self {
            retryable: retryable.into_iter().map(|t| t.to_lowercase()).collect(),
            terminal: terminal.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    /// The default table for final saga errors feeding the quarantine.
    pub fn saga_defaults() -> Self {
        Self::new(
            SAGA_RETRYABLE.iter().map(|s| s.to_string()).collect(),
            SAGA_TERMINAL.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// The default table for compensation failures.
    pub fn compensation_defaults() -> Self {
        Self::new(
            COMPENSATION_RETRYABLE
                .iter()
                .map(|s| s.to_string())
                .collect(),
            COMPENSATION_TERMINAL
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// Classifies a failure message.
    pub fn classify(&self, message: &str) -> FailureKind {
        let message = message.to_lowercase();
        if self.terminal.iter().any(|t| message.contains(t)) {
            return FailureKind::Terminal;
        }
        if self.retryable.iter().any(|t| message.contains(t)) {
            return FailureKind::Retryable;
        }
        FailureKind::Terminal
    }

    /// Convenience for callers that only care about retryability.
    pub fn is_retryable(&self, message: &str) -> bool {
        self.classify(message) == FailureKind::Retryable
    }
}
