//! # API Handlers
//!
//! The hub speaks the same wire API as a single backend, so existing
//! clients can point at it unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::rejection::{FormRejection, QueryRejection},
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Form, Json,
};
use mp_core::{Error, ExcludedBackend, Federated, LogRecord, DEFAULT_LIMIT, DEFAULT_OFFSET};
use serde::{Deserialize, Serialize};

use crate::auth::session_token;
use crate::AppState;

// =============================================================================
// Types
// =============================================================================

/// Success body: `{"result": ...}`, plus the skipped backends under the
/// partial failure policy.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub result: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedBackend>,
}

impl<T> From<Federated<T>> for Envelope<T> {
    fn from(federated: Federated<T>) -> Self {
        Self {
            result: federated.value,
            excluded: federated.excluded,
        }
    }
}

impl<T> Envelope<T> {
    fn plain(result: T) -> Self {
        Self {
            result,
            excluded: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub kind: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.to_string(),
            status,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", error)
    }

    pub fn unauthorized(error: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", error)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Authentication { .. }
            | Error::MalformedResponse { .. }
            | Error::MergeInvariantViolation { .. } => StatusCode::BAD_GATEWAY,
            Error::BackendUnavailable { .. } | Error::InvalidSessionState { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        };
        tracing::warn!(status = status.as_u16(), error = %err, "request failed");
        Self {
            error: err.to_string(),
            kind: err.kind().to_string(),
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub from: i64,
    pub to: i64,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub search_expressions: Option<String>,
}

impl SearchParams {
    fn into_query(self, logspace: String) -> mp_core::Query {
        let mut query = mp_core::Query::new(logspace, self.from, self.to)
            .with_offset(self.offset.unwrap_or(DEFAULT_OFFSET))
            .with_limit(self.limit.unwrap_or(DEFAULT_LIMIT));
        if let Some(expression) = self.search_expressions {
            query = query.with_search_expression(expression);
        }
        query
    }
}

#[derive(Debug, Serialize)]
pub struct HubStatus {
    pub version: &'static str,
    pub started_at: String,
    pub uptime_seconds: i64,
    pub backends: Vec<String>,
    pub failure_policy: mp_core::FailurePolicy,
    pub timeout_ms: u64,
    pub open: bool,
    pub sessions: usize,
}

// =============================================================================
// Sessions
// =============================================================================

pub async fn login(
    State(state): State<Arc<AppState>>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Json<Envelope<String>>, ApiError> {
    let Form(form) = form.map_err(|e| ApiError::bad_request(e.body_text()))?;
    state
        .sessions
        .login(&form.username, &form.password)
        .await
        .map(|token| Json(Envelope::plain(token)))
        .ok_or_else(|| ApiError::unauthorized("invalid username or password"))
}

pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Envelope<bool>> {
    let ended = match session_token(&headers) {
        Some(token) => state.sessions.logout(&token).await,
        None => false,
    };
    Json(Envelope::plain(ended))
}

/// Guards the search routes unless the hub is open.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.sessions.is_open() {
        return Ok(next.run(req).await);
    }
    let path = req.uri().path().to_string();
    let Some(token) = session_token(req.headers()) else {
        tracing::warn!(path, "missing session cookie");
        return Err(ApiError::unauthorized("missing AUTHENTICATION_TOKEN cookie"));
    };
    if state.sessions.validate(&token).await.is_none() {
        tracing::warn!(path, "invalid session token");
        return Err(ApiError::unauthorized("invalid or expired session"));
    }
    Ok(next.run(req).await)
}

// =============================================================================
// Search
// =============================================================================

pub async fn list_logspaces(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<BTreeSet<String>>>, ApiError> {
    let logspaces = state.proxy.list_logspaces().await?;
    Ok(Json(logspaces.into()))
}

pub async fn filter(
    State(state): State<Arc<AppState>>,
    Path(logspace): Path<String>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<Envelope<Vec<LogRecord>>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let records = state.proxy.filter(&params.into_query(logspace)).await?;
    Ok(Json(records.into()))
}

pub async fn count(
    State(state): State<Arc<AppState>>,
    Path(logspace): Path<String>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<Envelope<u64>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let total = state.proxy.count(&params.into_query(logspace)).await?;
    Ok(Json(total.into()))
}

// =============================================================================
// Status
// =============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> Json<HubStatus> {
    let settings = state.proxy.settings();
    Json(HubStatus {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at.to_rfc3339(),
        uptime_seconds: (chrono::Utc::now() - state.started_at).num_seconds(),
        backends: state
            .proxy
            .backends()
            .iter()
            .map(|b| b.name().to_string())
            .collect(),
        failure_policy: settings.failure_policy,
        timeout_ms: settings.timeout_ms,
        open: state.sessions.is_open(),
        sessions: state.sessions.active().await,
    })
}
