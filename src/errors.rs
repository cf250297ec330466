//! Error taxonomy for the execution core.
//!
//! Every fallible surface in this crate returns one of the typed errors
//! defined here or in a sibling module's own `*Error` enum that wraps into
//! [`CoreError`] at the boundary. Kinds (not Rust types) drive severity and
//! retry classification per the taxonomy used throughout the orchestrator,
//! retry manager, and recovery manager.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy shared by node execution, retries, and recovery.
///
/// This is a *kind*, not a concrete error type: it classifies failures for
/// routing decisions (continue-on-fail, retry eligibility, recovery
/// strategy selection) independent of which subsystem raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    NodeFailed,
    InvalidInput,
    ResourceNotFound,
    PermissionDenied,
    RateLimited,
    ServiceUnavailable,
    NetworkError,
    ScriptError,
    DatabaseError,
    ApiError,
    Unknown,
}

impl ErrorKind {
    /// Severity bucket for this kind.
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::RateLimited | ErrorKind::Timeout => Severity::Low,
            ErrorKind::InvalidInput | ErrorKind::ResourceNotFound => Severity::Medium,
            ErrorKind::PermissionDenied | ErrorKind::ScriptError => Severity::High,
            ErrorKind::ServiceUnavailable | ErrorKind::DatabaseError => Severity::Critical,
            ErrorKind::NetworkError | ErrorKind::ApiError | ErrorKind::NodeFailed => {
                Severity::Medium
            }
            ErrorKind::Unknown => Severity::Medium,
        }
    }

    /// Whether a failure of this kind is, by default, worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::NetworkError
                | ErrorKind::ServiceUnavailable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single error recorded against an execution or node execution.
///
/// Carries an optional cause chain so the first-cause message survives
/// wrapping by higher layers (orchestrator, recovery manager) without
/// losing the original diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub retryable: bool,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.is_retryable();
        Self {
            kind,
            message: message.into(),
            node_id: None,
            retryable,
            when: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Classify a raw error message the way the retry manager's portable
    /// fallback classifier does: substring matching over the rendered text.
    pub fn classify(message: &str) -> ErrorKind {
        let lower = message.to_ascii_lowercase();
        if lower.contains("timeout") {
            ErrorKind::Timeout
        } else if lower.contains("rate limit") || lower.contains("429") {
            ErrorKind::RateLimited
        } else if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("network")
        {
            ErrorKind::NetworkError
        } else if lower.contains("503") || lower.contains("504") {
            ErrorKind::ServiceUnavailable
        } else if lower.contains("temporary") || lower.contains("eof") {
            ErrorKind::NodeFailed
        } else {
            ErrorKind::Unknown
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = Self::classify(&message);
        Self::new(kind, message)
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Top-level error type for fallible crate-wide operations that don't
/// belong to one subsystem's own error enum (e.g. construction helpers).
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error("workflow {0} is not active")]
    #[diagnostic(code(loomwork::workflow_inactive))]
    WorkflowInactive(String),

    #[error("workflow {0} not found")]
    #[diagnostic(code(loomwork::workflow_not_found))]
    WorkflowNotFound(String),

    #[error("execution {0} not found")]
    #[diagnostic(code(loomwork::execution_not_found))]
    ExecutionNotFound(String),

    #[error(transparent)]
    #[diagnostic(code(loomwork::execution))]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    #[diagnostic(code(loomwork::serde_json))]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeout_substring() {
        assert_eq!(
            ExecutionError::classify("request timeout after 30s"),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn classifies_rate_limit_and_429() {
        assert_eq!(ExecutionError::classify("HTTP 429"), ErrorKind::RateLimited);
        assert_eq!(
            ExecutionError::classify("rate limit exceeded"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn unknown_falls_back() {
        assert_eq!(
            ExecutionError::classify("divide by zero"),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn severity_mapping_covers_each_bucket() {
        assert_eq!(ErrorKind::RateLimited.severity(), Severity::Low);
        assert_eq!(ErrorKind::InvalidInput.severity(), Severity::Medium);
        assert_eq!(ErrorKind::PermissionDenied.severity(), Severity::High);
        assert_eq!(ErrorKind::DatabaseError.severity(), Severity::Critical);
    }
}
