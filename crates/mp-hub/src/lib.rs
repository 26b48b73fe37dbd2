//! # mp-hub: The "Front Door" of mergeproxy
//!
//! Serves a [`MergeProxy`] over the same HTTP API a single backend
//! exposes. The binary in `main.rs` wires configuration and shutdown; the
//! router lives here so it can be driven in tests.

pub mod api;
pub mod auth;
pub mod config;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use mp_core::MergeProxy;
use tower_http::cors::CorsLayer;

use crate::auth::SessionStore;

pub struct AppState {
    pub proxy: MergeProxy,
    pub sessions: SessionStore,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(proxy: MergeProxy, sessions: SessionStore) -> Self {
        Self {
            proxy,
            sessions,
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let search = Router::new()
        .route(
            "/api/1/search/logspace/list_logspaces",
            get(api::list_logspaces),
        )
        .route("/api/1/search/logspace/filter/:logspace", get(api::filter))
        .route(
            "/api/1/search/logspace/number_of_messages/:logspace",
            get(api::count),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_session,
        ));

    Router::new()
        .route("/api/1/login", post(api::login))
        .route("/api/1/logout", get(api::logout))
        .route("/api/status", get(api::status))
        .merge(search)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
