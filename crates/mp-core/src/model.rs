//! # Data Model
//!
//! The values that flow through the federation: log records keyed by
//! `processed_timestamp`, the logical [`Query`], backend credentials and
//! session states, and the [`Federated`] wrapper every proxy operation
//! returns.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ErrorKind;

/// Field every record must carry; the sole merge key.
pub const PROCESSED_TIMESTAMP: &str = "processed_timestamp";

/// Offset used when the caller does not supply one.
pub const DEFAULT_OFFSET: u64 = 0;

/// Limit used when the caller does not supply one.
pub const DEFAULT_LIMIT: u64 = 10;

// =============================================================================
// LogRecord
// =============================================================================

/// One log message as returned by a backend.
///
/// The field map is carried through untouched; only `processed_timestamp`
/// is interpreted. A record without an integer timestamp cannot be
/// constructed, so every `LogRecord` in the system is mergeable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct LogRecord {
    processed_timestamp: i64,
    fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRecord {
    #[error("log record is not a JSON object")]
    NotAnObject,
    #[error("log record has no `processed_timestamp` field")]
    MissingTimestamp,
    #[error("`processed_timestamp` is not an integer: {0}")]
    NonIntegerTimestamp(Value),
}

impl LogRecord {
    #[inline]
    pub fn processed_timestamp(&self) -> i64 {
        self.processed_timestamp
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl TryFrom<Map<String, Value>> for LogRecord {
    type Error = InvalidRecord;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let raw = fields
            .get(PROCESSED_TIMESTAMP)
            .ok_or(InvalidRecord::MissingTimestamp)?;
        let processed_timestamp = raw
            .as_i64()
            .ok_or_else(|| InvalidRecord::NonIntegerTimestamp(raw.clone()))?;
        Ok(Self {
            processed_timestamp,
            fields,
        })
    }
}

impl TryFrom<Value> for LogRecord {
    type Error = InvalidRecord;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Self::try_from(fields),
            _ => Err(InvalidRecord::NotAnObject),
        }
    }
}

impl Serialize for LogRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

// =============================================================================
// Query
// =============================================================================

/// One logical search request: time window, optional opaque search
/// expression, and pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub logspace: String,
    pub from: i64,
    pub to: i64,
    pub search_expression: Option<String>,
    pub offset: u64,
    pub limit: u64,
}

impl Query {
    pub fn new(logspace: impl Into<String>, from: i64, to: i64) -> Self {
        Self {
            logspace: logspace.into(),
            from,
            to,
            search_expression: None,
            offset: DEFAULT_OFFSET,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_search_expression(mut self, expression: impl Into<String>) -> Self {
        self.search_expression = Some(expression.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// The query sent to each backend for a federated `filter`.
    ///
    /// Every record in the global window `[offset, offset + limit)` lies
    /// within the first `offset + limit` records of its own backend, so
    /// that is all we ask for. With `offset == 0` this is exactly `limit`.
    pub fn per_backend(&self) -> Query {
        Query {
            offset: 0,
            limit: self.offset.saturating_add(self.limit),
            ..self.clone()
        }
    }

    /// The query sent to each backend for a federated `count`. Pagination
    /// does not apply to a count, so the caller's values are dropped.
    pub fn for_count(&self) -> Query {
        Query {
            offset: DEFAULT_OFFSET,
            limit: DEFAULT_LIMIT,
            ..self.clone()
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Username/password pair used to open a backend session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Lifecycle of one backend handle:
/// `Unauthenticated --login--> Authenticated --logout--> LoggedOut`.
///
/// Queries may only be issued from `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    LoggedOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::LoggedOut => write!(f, "logged out"),
        }
    }
}

// =============================================================================
// Federated results
// =============================================================================

/// A backend skipped under [`crate::FailurePolicy::Partial`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedBackend {
    /// Position of the backend in the proxy's backend list.
    pub index: usize,
    pub backend: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Result of one federated operation.
///
/// Under the default fail-fast policy `excluded` is always empty; a
/// non-empty list means the value is missing those backends' data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Federated<T> {
    pub value: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedBackend>,
}

impl<T> Federated<T> {
    pub fn complete(value: T) -> Self {
        Self {
            value,
            excluded: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.excluded.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Federated<U> {
        Federated {
            value: f(self.value),
            excluded: self.excluded,
        }
    }
}
