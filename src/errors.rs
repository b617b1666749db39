//! Error types for the async wait stage.
//!
//! Failures live at three levels:
//!
//! - [`InvocationError`]: one attempt of the user function failed.
//!   Local to that attempt and possibly retried.
//!
//! - [`EntryError`]: a queue entry resolved terminally without a
//!   usable result. Fatal to the stage unless a fallback is
//!   configured.
//!
//! - [`AsyncWaitError`]: what the stage reports to whoever drives it.
//!
//! A full queue is never an error. It is backpressure and shows up as
//! either a blocked [`crate::AsyncWaitOperator::process_element`] or
//! an [`crate::Admission::Full`].

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::recovery::StepId;

/// Failure reported by the user function for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    pub fn new(message: impl Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal failure of a single queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    /// The last attempt reported an error and no retry was possible.
    #[error("async invocation failed: {0}")]
    Invocation(#[from] InvocationError),
    /// The overall timeout elapsed before a result arrived.
    #[error("async invocation timed out after {elapsed:?} and {attempts} attempt(s)")]
    Timeout { elapsed: Duration, attempts: u32 },
}

impl EntryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from reading or writing checkpoint state.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("checkpoint store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint store migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("unable to (de)serialize checkpoint state: {0}")]
    Serde(#[from] bincode::Error),
}

/// Errors surfaced by the async wait stage.
#[derive(Debug, Error)]
pub enum AsyncWaitError {
    /// Rejected at construction time; never raised at runtime.
    #[error("invalid async wait configuration: {0}")]
    ConfigurationInvalid(String),
    /// An entry failed terminally and there was no fallback. The
    /// stage has been torn down.
    #[error("step {step_id} failed processing input {input}: {source}")]
    EntryFailed {
        step_id: StepId,
        input: String,
        source: EntryError,
    },
    /// The stage already failed or was closed.
    #[error("step {step_id} is no longer running")]
    Closed { step_id: StepId },
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    /// The driver's mailbox runtime could not be started.
    #[error("unable to start mailbox runtime: {0}")]
    Runtime(#[from] std::io::Error),
    /// The stage had to wait while running on a current-thread tokio
    /// runtime, which it can't block.
    #[error("unable to block inside a current-thread tokio runtime; drive the stage from a multi-thread runtime or a plain thread")]
    CurrentThreadRuntime,
}

impl AsyncWaitError {
    #[track_caller]
    pub(crate) fn invalid(msg: impl Display) -> Self {
        let caller = std::panic::Location::caller();
        tracing::debug!("({caller}) rejecting configuration: {msg}");
        Self::ConfigurationInvalid(msg.to_string())
    }

    /// The terminal entry failure behind this error, if any.
    pub fn entry_error(&self) -> Option<&EntryError> {
        match self {
            Self::EntryFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[test]
fn entry_failure_message_names_input() {
    let err = AsyncWaitError::EntryFailed {
        step_id: StepId("lookup".to_owned()),
        input: "\"key-1\"".to_owned(),
        source: EntryError::Invocation(InvocationError::new("connection refused")),
    };
    assert_eq!(
        err.to_string(),
        "step lookup failed processing input \"key-1\": async invocation failed: connection refused"
    );
}

#[test]
fn timeout_is_classified() {
    let err = EntryError::Timeout {
        elapsed: Duration::from_secs(1),
        attempts: 2,
    };
    assert!(err.is_timeout());
    assert!(!EntryError::from(InvocationError::new("x")).is_timeout());
}
