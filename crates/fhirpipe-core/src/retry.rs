//! Failure classification and exponential backoff.
//!
//! Two independent layers share these rules: the HTTP transport retries
//! individual requests, and the orchestrator retries failed steps on user
//! request. Each layer keeps its own attempt budget.

use crate::error::{ErrorKind, PipelineError};
use crate::job::Step;
use std::io;
use std::time::Duration;

/// Classifies an HTTP status code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        500..=599 => ErrorKind::Transient,
        400..=499 => ErrorKind::NonTransient,
        // Anything else reaching classification is unexpected; do not retry.
        _ => ErrorKind::NonTransient,
    }
}

/// Classifies a reqwest error: connectivity problems and timeouts are
/// transient, response-level failures follow the status code, decode
/// failures are non-transient.
pub fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() {
        return ErrorKind::Transient;
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16());
    }
    if err.is_decode() {
        return ErrorKind::NonTransient;
    }
    // Request/body errors without a response are usually the network.
    if err.is_request() || err.is_body() {
        return ErrorKind::Transient;
    }
    ErrorKind::NonTransient
}

/// Local filesystem errors (missing source, not a directory, permissions)
/// do not fix themselves.
pub fn classify_io(_err: &io::Error) -> ErrorKind {
    ErrorKind::NonTransient
}

/// Converts a reqwest error into a pipeline error, keeping the status code
/// when one is available.
pub fn pipeline_error_from_reqwest(err: &reqwest::Error) -> PipelineError {
    let kind = classify_reqwest(err);
    let mut pe = PipelineError::new(kind, err.to_string());
    if let Some(status) = err.status() {
        pe = pe.with_status(status.as_u16());
    }
    pe
}

/// Backoff delay before attempt `attempt + 1`, 0-based:
/// `min(initial_ms * 2^attempt, max_ms)`.
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay_ms = initial_ms.saturating_mul(factor).min(max_ms);
    Duration::from_millis(delay_ms)
}

/// Decides whether a failed step may be retried. Refusals carry the
/// specific reason.
pub fn check_retry_allowed(step: &Step, max_attempts: u32) -> Result<(), PipelineError> {
    let last_error = step.last_error.as_ref().ok_or_else(|| {
        PipelineError::non_transient(format!(
            "retry not allowed: step '{}' has no recorded error",
            step.name
        ))
    })?;
    if last_error.kind == ErrorKind::NonTransient {
        return Err(PipelineError::non_transient(format!(
            "retry not allowed: step '{}' failed with a non-transient error: {}",
            step.name, last_error.message
        )));
    }
    if step.retry_count >= max_attempts {
        return Err(PipelineError::non_transient(format!(
            "retry not allowed: step '{}' reached the maximum of {} attempts",
            step.name, max_attempts
        )));
    }
    Ok(())
}
