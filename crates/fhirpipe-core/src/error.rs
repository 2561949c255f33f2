//! Structured errors carried through the pipeline and persisted on steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a failed operation is worth attempting again.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The next attempt has a reasonable chance of succeeding (network
    /// hiccups, 5xx responses).
    Transient,
    /// The next attempt is expected to fail identically without operator
    /// action (bad input, 4xx responses, invalid configuration).
    NonTransient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::NonTransient => write!(f, "non-transient"),
        }
    }
}

/// The error type used across the pipeline crates.
///
/// Also the record persisted as a step's `last_error`, so it serializes
/// losslessly. `http_status` is 0 for failures that did not come from an
/// HTTP response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub http_status: u16,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn non_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonTransient, message)
    }

    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        PipelineError {
            kind,
            message: message.into(),
            http_status: 0,
            timestamp: Utc::now(),
        }
    }

    /// Attaches the HTTP status the error originated from.
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    /// Prefixes the message with higher-level context. The kind and status
    /// classification of the underlying error are preserved.
    pub fn wrap(self, context: impl fmt::Display) -> Self {
        PipelineError {
            message: format!("{}: {}", context, self.message),
            ..self
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.http_status != 0 {
            write!(f, "{} (HTTP {})", self.message, self.http_status)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        // Local filesystem problems do not fix themselves.
        PipelineError::non_transient(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::non_transient(format!("invalid JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_kind_and_status() {
        let inner = PipelineError::transient("connection reset").with_status(503);
        let outer = inner.wrap("downloading result file");
        assert_eq!(outer.kind, ErrorKind::Transient);
        assert_eq!(outer.http_status, 503);
        assert!(outer.message.starts_with("downloading result file: "));
    }

    #[test]
    fn display_includes_status_when_present() {
        let err = PipelineError::non_transient("bad request").with_status(400);
        assert_eq!(err.to_string(), "bad request (HTTP 400)");
        let err = PipelineError::non_transient("missing file");
        assert_eq!(err.to_string(), "missing file");
    }
}
