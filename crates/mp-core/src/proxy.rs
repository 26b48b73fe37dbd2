//! # Merge Proxy
//!
//! Presents a fixed list of [`Backend`]s as one logical backend. Each
//! operation fans out to every backend concurrently, waits for all of them
//! (each under its own timeout), then combines the answers:
//!
//! - `list_logspaces`: set union
//! - `count`: sum
//! - `filter`: k-way merge by `processed_timestamp`, truncated to `limit`
//!
//! # Why `limit` records per backend suffice
//!
//! Each backend's response is ascending. A record in the global top-`limit`
//! has fewer than `limit` records before it in the merged order, so in
//! particular fewer than `limit` before it in its own backend. It therefore
//! lies within that backend's first `limit` records, and asking any backend
//! for more cannot change the merged top-`limit`. The same argument with
//! `offset + limit` covers a non-zero offset.
//!
//! # Failure policy
//!
//! By default one failing backend fails the whole operation. Under
//! [`FailurePolicy::Partial`] failing backends are skipped and listed in
//! [`Federated::excluded`]. Merge invariant violations always fail.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::merge::KWayMerger;
use crate::model::{Credentials, ExcludedBackend, Federated, LogRecord, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any backend failure fails the operation.
    #[default]
    FailFast,
    /// Skip failing backends and report them in the result.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Per-backend call timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl ProxySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Configuration("timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

pub struct MergeProxy {
    backends: Vec<Arc<dyn Backend>>,
    settings: ProxySettings,
}

impl MergeProxy {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        Self::with_settings(backends, ProxySettings::default())
    }

    /// The order of `backends` is the tie-break order for equal timestamps.
    pub fn with_settings(backends: Vec<Arc<dyn Backend>>, settings: ProxySettings) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Configuration(
                "merge proxy needs at least one backend".into(),
            ));
        }
        settings.validate()?;
        Ok(Self { backends, settings })
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Log in to every backend; `credentials[i]` is used for backend `i`.
    pub async fn authenticate(&self, credentials: &[Credentials]) -> Result<Federated<()>> {
        if credentials.len() != self.backends.len() {
            return Err(Error::Configuration(format!(
                "{} credentials given for {} backends",
                credentials.len(),
                self.backends.len()
            )));
        }
        // Every login runs to completion so no session is opened unseen.
        let answers = self
            .gather(|index, backend| {
                let creds = credentials[index].clone();
                async move { backend.login(&creds.username, &creds.password).await }
            })
            .await;
        let (logged_in, first_error) = self.settle("login", answers);

        let failed = match first_error {
            Some(err) if logged_in.value.is_empty() => Some(err),
            Some(err) if self.settings.failure_policy == FailurePolicy::FailFast => Some(err),
            _ => None,
        };
        if let Some(err) = failed {
            tracing::warn!(error = %err, "login failed; closing sessions already opened");
            self.logout_all().await;
            return Err(err);
        }

        tracing::info!(
            backends = logged_in.value.len(),
            excluded = logged_in.excluded.len(),
            "authenticated against backends"
        );
        Ok(logged_in.map(|_| ()))
    }

    /// Log out of every backend. Never fails.
    pub async fn logout_all(&self) {
        futures::future::join_all(self.backends.iter().map(|backend| backend.logout())).await;
        tracing::info!(backends = self.backends.len(), "logged out of backends");
    }

    pub async fn list_logspaces(&self) -> Result<Federated<BTreeSet<String>>> {
        let answers = self
            .fan_out("list_logspaces", |_, backend| backend.list_logspaces())
            .await?;
        Ok(answers.map(|sets| {
            sets.into_iter()
                .fold(BTreeSet::new(), |mut union, (_, logspaces)| {
                    union.extend(logspaces);
                    union
                })
        }))
    }

    /// Sum of every backend's count. Pagination on `query` is ignored.
    /// A total that does not fit in `u64` is a `MalformedResponse` naming
    /// the backend whose count overflowed it.
    pub async fn count(&self, query: &Query) -> Result<Federated<u64>> {
        let per_backend = query.for_count();
        let answers = self
            .fan_out("count", |_, backend| backend.count(&per_backend))
            .await?;
        let mut total = 0u64;
        for (index, count) in &answers.value {
            total = total.checked_add(*count).ok_or_else(|| Error::MalformedResponse {
                backend: self.backends[*index].name().to_string(),
                reason: format!("message count {count} overflows the federated total"),
            })?;
        }
        Ok(answers.map(|_| total))
    }

    /// Records `[offset, offset + limit)` of the merged, ascending stream.
    pub async fn filter(&self, query: &Query) -> Result<Federated<Vec<LogRecord>>> {
        if query.limit == 0 {
            return Ok(Federated::complete(Vec::new()));
        }

        let per_backend = query.per_backend();
        let answers = self
            .fan_out("filter", |_, backend| backend.filter(&per_backend))
            .await?;

        let mut sources = Vec::with_capacity(answers.value.len());
        for (index, records) in &answers.value {
            ensure_ascending(self.backends[*index].name(), records)?;
            sources.push(records.len());
        }
        tracing::debug!(per_backend = ?sources, limit = query.limit, offset = query.offset, "merging");

        let Federated { value, excluded } = answers;
        let merger = KWayMerger::from_iters(
            value.into_iter().map(|(_, records)| records.into_iter()),
            |a: &LogRecord, b: &LogRecord| a.processed_timestamp().cmp(&b.processed_timestamp()),
        )?;
        let records = merger
            .skip(saturating_usize(query.offset))
            .take(saturating_usize(query.limit))
            .collect();

        Ok(Federated {
            value: records,
            excluded,
        })
    }

    /// Issue `call` to every backend concurrently and apply the failure
    /// policy. Successful answers are returned with their backend index,
    /// in backend order.
    async fn fan_out<'s, T, F, Fut>(
        &'s self,
        operation: &'static str,
        call: F,
    ) -> Result<Federated<Vec<(usize, T)>>>
    where
        F: Fn(usize, &'s dyn Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        tracing::debug!(operation, backends = self.backends.len(), "fanning out");

        match self.settings.failure_policy {
            FailurePolicy::FailFast => {
                let calls = self.backends.iter().enumerate().map(|(index, backend)| {
                    within(&self.settings, backend.as_ref(), call(index, backend.as_ref()))
                });
                let answers = futures::future::try_join_all(calls).await.map_err(|err| {
                    tracing::warn!(operation, error = %err, "backend call failed");
                    err
                })?;
                Ok(Federated::complete(answers.into_iter().enumerate().collect()))
            }
            FailurePolicy::Partial => {
                let answers = self.gather(call).await;
                match self.settle(operation, answers) {
                    (answers, Some(err)) if answers.value.is_empty() => Err(err),
                    (answers, _) => Ok(answers),
                }
            }
        }
    }

    /// Issue `call` to every backend concurrently and wait for all of them.
    async fn gather<'s, T, F, Fut>(&'s self, call: F) -> Vec<Result<T>>
    where
        F: Fn(usize, &'s dyn Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let calls = self.backends.iter().enumerate().map(|(index, backend)| {
            within(&self.settings, backend.as_ref(), call(index, backend.as_ref()))
        });
        futures::future::join_all(calls).await
    }

    /// Split answers into successes and excluded backends. Also returns the
    /// lowest-index error, if any.
    fn settle<T>(
        &self,
        operation: &'static str,
        answers: Vec<Result<T>>,
    ) -> (Federated<Vec<(usize, T)>>, Option<Error>) {
        let mut value = Vec::with_capacity(answers.len());
        let mut excluded = Vec::new();
        let mut first_error = None;
        for (index, answer) in answers.into_iter().enumerate() {
            match answer {
                Ok(answer) => value.push((index, answer)),
                Err(err) => {
                    tracing::warn!(
                        operation,
                        backend = self.backends[index].name(),
                        error = %err,
                        "excluding backend"
                    );
                    excluded.push(ExcludedBackend {
                        index,
                        backend: self.backends[index].name().to_string(),
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }
        (Federated { value, excluded }, first_error)
    }
}

/// Run one backend call under the per-backend timeout.
async fn within<T>(
    settings: &ProxySettings,
    backend: &dyn Backend,
    pending: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(settings.timeout(), pending).await {
        Ok(answer) => answer,
        Err(_) => Err(Error::Timeout {
            backend: backend.name().to_string(),
            timeout_ms: settings.timeout_ms,
        }),
    }
}

/// A backend's filter response must be non-decreasing in timestamp.
fn ensure_ascending(backend: &str, records: &[LogRecord]) -> Result<()> {
    for (position, pair) in records.windows(2).enumerate() {
        let (previous, current) = (pair[0].processed_timestamp(), pair[1].processed_timestamp());
        if current < previous {
            return Err(Error::MergeInvariantViolation {
                backend: backend.to_string(),
                position: position + 1,
                previous,
                current,
            });
        }
    }
    Ok(())
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
