//! # Hub Sessions
//!
//! Logins against the hub itself. Tokens are random, handed out once and
//! kept only as SHA-256 hashes.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::UserConfig;

pub const TOKEN_COOKIE: &str = "AUTHENTICATION_TOKEN";

/// Lifetime of a hub session when none is configured.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

struct User {
    username: String,
    password_hash: String,
}

#[derive(Debug, Clone)]
pub struct HubSession {
    pub username: String,
    token_hash: String,
    pub created_at: DateTime<Utc>,
}

pub struct SessionStore {
    users: Vec<User>,
    ttl: Duration,
    sessions: RwLock<Vec<HubSession>>,
}

impl SessionStore {
    pub fn new(users: &[UserConfig]) -> Self {
        Self::with_ttl(users, std::time::Duration::from_secs(DEFAULT_SESSION_TTL_SECS))
    }

    pub fn with_ttl(users: &[UserConfig], ttl: std::time::Duration) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| User {
                    username: u.username.clone(),
                    password_hash: sha256_hex(&u.password),
                })
                .collect(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500)),
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// No users configured: every login succeeds and no route checks a token.
    pub fn is_open(&self) -> bool {
        self.users.is_empty()
    }

    /// Returns the raw token on success. An open hub hands out tokens
    /// without keeping them.
    pub async fn login(&self, username: &str, password: &str) -> Option<String> {
        let token = uuid::Uuid::new_v4().as_simple().to_string();
        if self.is_open() {
            tracing::debug!(user = username, "hub login (open)");
            return Some(token);
        }

        let hash = sha256_hex(password);
        let known = self
            .users
            .iter()
            .any(|u| u.username == username && constant_time_eq(&u.password_hash, &hash));
        if !known {
            tracing::warn!(user = username, "rejected hub login");
            return None;
        }

        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|s| !self.expired(s, now));
        sessions.push(HubSession {
            username: username.to_string(),
            token_hash: sha256_hex(&token),
            created_at: now,
        });
        tracing::info!(user = username, active = sessions.len(), "hub login");
        Some(token)
    }

    /// The live session for `token`. Expired sessions are invalid.
    pub async fn validate(&self, token: &str) -> Option<HubSession> {
        let hash = sha256_hex(token);
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .find(|s| constant_time_eq(&s.token_hash, &hash) && !self.expired(s, now))
            .cloned()
    }

    /// Returns whether a session was ended.
    pub async fn logout(&self, token: &str) -> bool {
        let hash = sha256_hex(token);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| !constant_time_eq(&s.token_hash, &hash));
        before != sessions.len()
    }

    /// Sessions that have not expired.
    pub async fn active(&self) -> usize {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions.iter().filter(|s| !self.expired(s, now)).count()
    }

    fn expired(&self, session: &HubSession, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.created_at) >= self.ttl
    }
}

/// Pull the session token out of the request's cookies.
pub fn session_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, token)| token.to_string())
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}
