//! # Federation Errors
//!
//! Every public operation either returns a complete result or fails with
//! exactly one [`Error`]. Per-backend variants carry the backend's display
//! name so the caller can tell which member of the federation failed.

use serde::Serialize;

use crate::model::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed producer/backend list or configuration file.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed on backend '{backend}': {reason}")]
    Authentication { backend: String, reason: String },

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("backend '{backend}' timed out after {timeout_ms} ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("malformed response from backend '{backend}': {reason}")]
    MalformedResponse { backend: String, reason: String },

    #[error(
        "backend '{backend}' returned records out of order at position {position}: \
         processed_timestamp {current} follows {previous}"
    )]
    MergeInvariantViolation {
        backend: String,
        position: usize,
        previous: i64,
        current: i64,
    },

    #[error("backend '{backend}' is {state}; queries require an authenticated session")]
    InvalidSessionState {
        backend: String,
        state: SessionState,
    },
}

/// Coarse failure category, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    BackendUnavailable,
    MalformedResponse,
    MergeInvariantViolation,
    InvalidSessionState,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => f.write_str("configuration"),
            Self::Authentication => f.write_str("authentication"),
            Self::BackendUnavailable => f.write_str("backend_unavailable"),
            Self::MalformedResponse => f.write_str("malformed_response"),
            Self::MergeInvariantViolation => f.write_str("merge_invariant_violation"),
            Self::InvalidSessionState => f.write_str("invalid_session_state"),
        }
    }
}

impl Error {
    /// A timeout is reported as [`ErrorKind::BackendUnavailable`]; use
    /// [`Error::is_timeout`] to tell the two apart.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::BackendUnavailable { .. } | Error::Timeout { .. } => {
                ErrorKind::BackendUnavailable
            }
            Error::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Error::MergeInvariantViolation { .. } => ErrorKind::MergeInvariantViolation,
            Error::InvalidSessionState { .. } => ErrorKind::InvalidSessionState,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Name of the backend the failure originated from, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Error::Configuration(_) => None,
            Error::Authentication { backend, .. }
            | Error::BackendUnavailable { backend, .. }
            | Error::Timeout { backend, .. }
            | Error::MalformedResponse { backend, .. }
            | Error::MergeInvariantViolation { backend, .. }
            | Error::InvalidSessionState { backend, .. } => Some(backend),
        }
    }
}
