//! # Backend Capability
//!
//! The only view of a log-search backend the federation has. One concrete
//! adapter per transport implements [`Backend`]; the [`crate::MergeProxy`]
//! never sees a concrete type.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{LogRecord, Query};

/// One backend endpoint together with its own session.
///
/// Implementations keep their authentication token private to the handle.
/// Calling a query method on a handle that is not authenticated must fail
/// with [`crate::Error::InvalidSessionState`] rather than reach the network.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Display name used in errors and logs (usually the host).
    fn name(&self) -> &str;

    /// Exchange credentials for a session token held by this handle.
    async fn login(&self, username: &str, password: &str) -> Result<()>;

    async fn list_logspaces(&self) -> Result<BTreeSet<String>>;

    /// Number of messages matching `query` in its time window.
    async fn count(&self, query: &Query) -> Result<u64>;

    /// Up to `query.limit` matching records, ascending by
    /// `processed_timestamp`.
    async fn filter(&self, query: &Query) -> Result<Vec<LogRecord>>;

    /// End the session. Best effort: failures are logged, not returned.
    async fn logout(&self);
}
