//! # Backend Client
//!
//! One authenticated HTTP session against one backend.
//!
//! Wire protocol:
//!
//! | Call            | Request                                                   |
//! |-----------------|-----------------------------------------------------------|
//! | login           | `POST /api/1/login` (form: `username`, `password`)        |
//! | list logspaces  | `GET /api/1/search/logspace/list_logspaces`               |
//! | filter          | `GET /api/1/search/logspace/filter/<logspace>?...`        |
//! | count           | `GET /api/1/search/logspace/number_of_messages/<ls>?...`  |
//! | logout          | `GET /api/1/logout`                                       |
//!
//! Every response body is `{"result": <value>}`. After login, requests carry
//! the session token as the `AUTHENTICATION_TOKEN` cookie.

use std::collections::BTreeSet;
use std::time::Duration;

use mp_core::{Backend, Error, LogRecord, Query, Result, SessionState};
use reqwest::header::COOKIE;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::BackendConfig;

pub const TOKEN_COOKIE: &str = "AUTHENTICATION_TOKEN";

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

struct Session {
    state: SessionState,
    token: Option<String>,
}

pub struct SsbClient {
    name: String,
    base: Url,
    http: reqwest::Client,
    timeout: Duration,
    session: RwLock<Session>,
}

impl SsbClient {
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> Result<Self> {
        Self::new(config.name(), config.base_url()?, timeout)
    }

    /// `base` must be an `http` or `https` URL; the API paths are appended
    /// to it.
    pub fn new(name: impl Into<String>, base: Url, timeout: Duration) -> Result<Self> {
        let name = name.into();
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "backend '{name}': unsupported base url {base}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("backend '{name}': {e}")))?;
        Ok(Self {
            name,
            base,
            http,
            timeout,
            session: RwLock::new(Session {
                state: SessionState::Unauthenticated,
                token: None,
            }),
        })
    }

    pub async fn state(&self) -> SessionState {
        self.session.read().await.state
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                Error::Configuration(format!("backend '{}': base url cannot be extended", self.name))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn search_endpoint(&self, command: &str, logspace: &str) -> Result<Url> {
        self.endpoint(&["api", "1", "search", "logspace", command, logspace])
    }

    async fn token(&self) -> Result<String> {
        let session = self.session.read().await;
        match (&session.state, &session.token) {
            (SessionState::Authenticated, Some(token)) => Ok(token.clone()),
            (state, _) => Err(Error::InvalidSessionState {
                backend: self.name.clone(),
                state: *state,
            }),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, params: &[(&str, String)]) -> Result<T> {
        let token = self.token().await?;
        tracing::debug!(backend = %self.name, path = url.path(), "GET");
        let response = self
            .http
            .get(url)
            .query(params)
            .header(COOKIE, format!("{TOKEN_COOKIE}={token}"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                backend: self.name.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(Error::BackendUnavailable {
                backend: self.name.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|e| Error::MalformedResponse {
                backend: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(envelope.result)
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                backend: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            Error::BackendUnavailable {
                backend: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }
}

fn search_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("from", query.from.to_string()),
        ("to", query.to.to_string()),
        ("offset", query.offset.to_string()),
        ("limit", query.limit.to_string()),
    ];
    if let Some(expression) = &query.search_expression {
        params.push(("search_expressions", expression.clone()));
    }
    params
}

#[async_trait::async_trait]
impl Backend for SsbClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = self.endpoint(&["api", "1", "login"])?;
        let response = self
            .http
            .post(url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let token: String = match self.decode(response).await {
            Ok(token) => token,
            Err(Error::MalformedResponse { reason, .. }) => {
                return Err(Error::Authentication {
                    backend: self.name.clone(),
                    reason: format!("login response carried no token: {reason}"),
                })
            }
            Err(err) => return Err(err),
        };
        if token.is_empty() {
            return Err(Error::Authentication {
                backend: self.name.clone(),
                reason: "login returned an empty token".into(),
            });
        }

        let mut session = self.session.write().await;
        session.state = SessionState::Authenticated;
        session.token = Some(token);
        tracing::info!(backend = %self.name, user = username, "logged in");
        Ok(())
    }

    async fn list_logspaces(&self) -> Result<BTreeSet<String>> {
        let url = self.endpoint(&["api", "1", "search", "logspace", "list_logspaces"])?;
        self.get(url, &[]).await
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        let url = self.search_endpoint("number_of_messages", &query.logspace)?;
        self.get(url, &search_params(query)).await
    }

    async fn filter(&self, query: &Query) -> Result<Vec<LogRecord>> {
        let url = self.search_endpoint("filter", &query.logspace)?;
        self.get(url, &search_params(query)).await
    }

    async fn logout(&self) {
        let token = match self.token().await {
            Ok(token) => token,
            Err(_) => {
                tracing::debug!(backend = %self.name, "logout without a session");
                return;
            }
        };

        match self.endpoint(&["api", "1", "logout"]) {
            Ok(url) => {
                let sent = self
                    .http
                    .get(url)
                    .header(COOKIE, format!("{TOKEN_COOKIE}={token}"))
                    .send()
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(backend = %self.name, error = %e, "logout request failed");
                }
            }
            Err(e) => tracing::warn!(backend = %self.name, error = %e, "logout skipped"),
        }

        let mut session = self.session.write().await;
        session.state = SessionState::LoggedOut;
        session.token = None;
        tracing::info!(backend = %self.name, "logged out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query as QueryParams, State};
    use axum::http::{HeaderMap, Method, StatusCode as HttpStatus, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use mp_core::ErrorKind;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    const USERNAME: &str = "foo";
    const PASSWORD: &str = "bar";
    const TOKEN: &str = "asdfasdfaqwerqwerqewr";
    const LOGSPACE: &str = "apple";

    #[derive(Debug, Clone)]
    struct Recorded {
        method: Method,
        path: String,
        params: HashMap<String, String>,
        cookie: Option<String>,
        body: String,
    }

    /// Canned answers for the mock backend.
    #[derive(Clone)]
    struct Script {
        login: (HttpStatus, String),
        logspaces: Value,
        records: Value,
        count: Value,
        search_status: HttpStatus,
        /// Raw body for every search route, bypassing the envelope.
        search_body: Option<&'static str>,
        delay: Option<Duration>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                login: (HttpStatus::OK, json!({"result": TOKEN}).to_string()),
                logspaces: json!(["logspace1", "foo", "bar", "logspace4"]),
                records: json!([
                    {"processed_timestamp": 1, "logmsg1": "logvalue1"},
                    {"processed_timestamp": 2, "logmsg2": "logvalue2"}
                ]),
                count: json!(999),
                search_status: HttpStatus::OK,
                search_body: None,
                delay: None,
            }
        }
    }

    struct MockState {
        script: Script,
        requests: Mutex<Vec<Recorded>>,
    }

    async fn handle(
        State(state): State<Arc<MockState>>,
        method: Method,
        uri: Uri,
        QueryParams(params): QueryParams<HashMap<String, String>>,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        let path = uri.path().to_string();
        state.requests.lock().unwrap().push(Recorded {
            method,
            path: path.clone(),
            params,
            cookie: headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });
        if let Some(delay) = state.script.delay {
            tokio::time::sleep(delay).await;
        }

        let script = &state.script;
        if path == "/api/1/login" {
            return (script.login.0, script.login.1.clone()).into_response();
        }
        if path == "/api/1/logout" {
            return HttpStatus::OK.into_response();
        }
        if script.search_status != HttpStatus::OK {
            return script.search_status.into_response();
        }
        if let Some(body) = script.search_body {
            return body.into_response();
        }
        let result = if path.ends_with("/list_logspaces") {
            script.logspaces.clone()
        } else if path.contains("/filter/") {
            script.records.clone()
        } else if path.contains("/number_of_messages/") {
            script.count.clone()
        } else {
            return HttpStatus::NOT_FOUND.into_response();
        };
        axum::Json(json!({ "result": result })).into_response()
    }

    async fn spawn_backend(script: Script) -> (SocketAddr, Arc<MockState>) {
        let state = Arc::new(MockState {
            script,
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    fn client_for(addr: SocketAddr, timeout: Duration) -> SsbClient {
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        SsbClient::new("mock", base, timeout).unwrap()
    }

    async fn logged_in(script: Script) -> (SsbClient, Arc<MockState>) {
        let (addr, state) = spawn_backend(script).await;
        let client = client_for(addr, Duration::from_secs(5));
        client.login(USERNAME, PASSWORD).await.unwrap();
        (client, state)
    }

    fn requests(state: &MockState) -> Vec<Recorded> {
        state.requests.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_login_posts_credentials_once() {
        let (client, state) = logged_in(Script::default()).await;

        let sent = requests(&state);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].path, "/api/1/login");
        assert_eq!(sent[0].body, "username=foo&password=bar");
        assert_eq!(client.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_queries_before_login_are_refused_locally() {
        let (addr, state) = spawn_backend(Script::default()).await;
        let client = client_for(addr, Duration::from_secs(5));

        let err = client.list_logspaces().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
        let err = client.filter(&Query::new(LOGSPACE, 1, 2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
        assert!(requests(&state).is_empty());
    }

    #[tokio::test]
    async fn test_list_logspaces_proxies_list_logspaces() {
        let (client, state) = logged_in(Script::default()).await;

        let logspaces = client.list_logspaces().await.unwrap();
        let expected: BTreeSet<String> = ["logspace1", "foo", "bar", "logspace4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(logspaces, expected);

        let sent = requests(&state);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].method, Method::GET);
        assert_eq!(sent[1].path, "/api/1/search/logspace/list_logspaces");
    }

    fn expected_params(with_expression: bool) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = [
            ("from", "123"),
            ("to", "456"),
            ("offset", "222"),
            ("limit", "333"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        if with_expression {
            params.insert("search_expressions".into(), "search_expression".into());
        }
        params
    }

    fn full_query() -> Query {
        Query::new(LOGSPACE, 123, 456)
            .with_search_expression("search_expression")
            .with_offset(222)
            .with_limit(333)
    }

    #[tokio::test]
    async fn test_filter_proxies_filter() {
        let (client, state) = logged_in(Script::default()).await;

        let records = client.filter(&full_query()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("logmsg1"), Some(&json!("logvalue1")));
        assert_eq!(records[1].processed_timestamp(), 2);

        let sent = requests(&state);
        assert_eq!(sent[1].path, "/api/1/search/logspace/filter/apple");
        assert_eq!(sent[1].params, expected_params(true));
    }

    #[tokio::test]
    async fn test_filter_omits_absent_search_expression() {
        let (client, state) = logged_in(Script::default()).await;

        let query = Query::new(LOGSPACE, 123, 456).with_offset(222).with_limit(333);
        client.filter(&query).await.unwrap();
        assert_eq!(requests(&state)[1].params, expected_params(false));
    }

    #[tokio::test]
    async fn test_count_proxies_number_of_messages() {
        let (client, state) = logged_in(Script::default()).await;

        assert_eq!(client.count(&full_query()).await.unwrap(), 999);

        let sent = requests(&state);
        assert_eq!(sent[1].path, "/api/1/search/logspace/number_of_messages/apple");
        assert_eq!(sent[1].params, expected_params(true));
    }

    #[tokio::test]
    async fn test_logspace_is_percent_encoded_in_path() {
        let (client, state) = logged_in(Script::default()).await;

        client.filter(&Query::new("my space/x", 1, 2)).await.unwrap();
        assert_eq!(
            requests(&state)[1].path,
            "/api/1/search/logspace/filter/my%20space%2Fx"
        );
    }

    #[tokio::test]
    async fn test_auth_token_is_sent_on_every_later_call() {
        let script = Script {
            logspaces: json!(["fake_logspace"]),
            records: json!([]),
            ..Script::default()
        };
        let (client, state) = logged_in(script).await;

        client.list_logspaces().await.unwrap();
        client.filter(&Query::new("fake_logspace", 123, 456)).await.unwrap();
        client.count(&Query::new("fake_logspace", 123, 456)).await.unwrap();
        client.logout().await;

        let sent = requests(&state);
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].cookie, None);
        for request in &sent[1..] {
            assert_eq!(
                request.cookie.as_deref(),
                Some("AUTHENTICATION_TOKEN=asdfasdfaqwerqwerqewr")
            );
        }
        assert_eq!(sent[4].path, "/api/1/logout");
    }

    #[tokio::test]
    async fn test_logout_ends_the_session() {
        let (client, state) = logged_in(Script::default()).await;

        client.logout().await;
        assert_eq!(client.state().await, SessionState::LoggedOut);

        let err = client.count(&Query::new(LOGSPACE, 1, 2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
        assert_eq!(requests(&state).len(), 2);

        // A second logout has nothing to end.
        client.logout().await;
        assert_eq!(requests(&state).len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_login_is_an_authentication_error() {
        let script = Script {
            login: (HttpStatus::UNAUTHORIZED, String::new()),
            ..Script::default()
        };
        let (addr, _state) = spawn_backend(script).await;
        let client = client_for(addr, Duration::from_secs(5));

        let err = client.login(USERNAME, "wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(client.state().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_login_without_token_is_an_authentication_error() {
        let script = Script {
            login: (HttpStatus::OK, json!({"error": "nope"}).to_string()),
            ..Script::default()
        };
        let (addr, _state) = spawn_backend(script).await;
        let client = client_for(addr, Duration::from_secs(5));

        let err = client.login(USERNAME, PASSWORD).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.to_string().contains("no token"));
    }

    #[tokio::test]
    async fn test_result_of_wrong_type_is_malformed() {
        let script = Script {
            count: json!("not a number"),
            ..Script::default()
        };
        let (client, _state) = logged_in(script).await;

        let err = client.count(&Query::new(LOGSPACE, 1, 2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_response_without_result_is_malformed() {
        let script = Script {
            search_body: Some("{}"),
            ..Script::default()
        };
        let (client, _state) = logged_in(script).await;

        let err = client.count(&Query::new(LOGSPACE, 1, 2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(err.to_string().contains("result"));
        let err = client.list_logspaces().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_record_without_timestamp_is_malformed() {
        let script = Script {
            records: json!([{"message": "no timestamp"}]),
            ..Script::default()
        };
        let (client, _state) = logged_in(script).await;

        let err = client.filter(&Query::new(LOGSPACE, 1, 2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_server_error_is_backend_unavailable() {
        let script = Script {
            search_status: HttpStatus::INTERNAL_SERVER_ERROR,
            ..Script::default()
        };
        let (client, _state) = logged_in(script).await;

        let err = client.list_logspaces().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_expired_session_is_an_authentication_error() {
        let script = Script {
            search_status: HttpStatus::UNAUTHORIZED,
            ..Script::default()
        };
        let (client, _state) = logged_in(script).await;

        let err = client.list_logspaces().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr, Duration::from_secs(5));
        let err = client.login(USERNAME, PASSWORD).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let script = Script {
            delay: Some(Duration::from_secs(2)),
            ..Script::default()
        };
        let (addr, _state) = spawn_backend(script).await;
        let client = client_for(addr, Duration::from_millis(100));

        let err = client.login(USERNAME, PASSWORD).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_connect_closes_opened_sessions_when_a_login_fails() {
        let (good_addr, good) = spawn_backend(Script::default()).await;
        let (bad_addr, bad) = spawn_backend(Script {
            login: (HttpStatus::UNAUTHORIZED, String::new()),
            ..Script::default()
        })
        .await;

        let text = format!(
            "[[backend]]\nhost = \"127.0.0.1\"\nport = {}\nuser = \"foo\"\npassword = \"bar\"\n\
             [[backend]]\nhost = \"127.0.0.1\"\nport = {}\nuser = \"foo\"\npassword = \"bar\"\n",
            good_addr.port(),
            bad_addr.port()
        );
        let config = crate::FederationConfig::from_toml_str(&text).unwrap();

        let err = crate::connect(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let paths: Vec<String> = requests(&good).into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/api/1/login", "/api/1/logout"]);
        assert_eq!(
            requests(&good)[1].cookie.as_deref(),
            Some("AUTHENTICATION_TOKEN=asdfasdfaqwerqwerqewr")
        );
        // The rejected backend never got a session to close.
        let paths: Vec<String> = requests(&bad).into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/api/1/login"]);
    }

    #[test]
    fn test_non_http_base_url_is_rejected() {
        let base = Url::parse("ftp://example.com/").unwrap();
        let err = SsbClient::new("ftp", base, Duration::from_secs(1)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
