//! REST session with password login, token revoke, and safe request logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use url::Url;

use super::{Session, SessionInfo, SessionSettings};
use crate::error::StreamError;
use crate::stream::RecordStream;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all Salesforce API requests.
const CLIENT_USER_AGENT: &str = concat!("record-stream/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "refresh_token",
    "client_secret",
    "password",
    "code",
    "token",
    "sid",
    "session",
    "authorization",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component.
    /// Example: `/services/data/v60.0/query`
    #[default]
    PathOnly,

    /// Log path and query parameters, with sensitive values redacted.
    /// Example: `/services/data/v60.0/query?q=SELECT+Id&sid=***`
    PathAndQueryRedacted,
}

fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Renders `url` for logging. The result never contains the scheme, host, or
/// fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let pairs: Vec<String> = url
                .query_pairs()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            if pairs.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, pairs.join("&"))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Token endpoint success body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
    #[serde(default)]
    id: Option<String>,
}

/// Token endpoint failure body.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RestSession
// ─────────────────────────────────────────────────────────────────────────────

/// A Salesforce REST session.
///
/// Clones share the same login state, so a session handed out by a pool and
/// the pool's own copy always agree on whether it is logged in.
#[derive(Clone)]
pub struct RestSession {
    http: reqwest::Client,
    settings: SessionSettings,
    info: Arc<RwLock<Option<SessionInfo>>>,
    logging_mode: LoggingMode,
}

impl RestSession {
    /// Creates a logged-out session.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Internal` if the HTTP client fails to initialize.
    pub fn new(settings: SessionSettings) -> Result<Self, StreamError> {
        Ok(Self {
            http: build_http_client()?,
            settings,
            info: Arc::new(RwLock::new(None)),
            logging_mode: LoggingMode::default(),
        })
    }

    /// Updates the logging mode for URL sanitization.
    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// Reuses an existing session instead of logging in.
    pub async fn restore(&self, info: SessionInfo) {
        *self.info.write().await = Some(info);
    }

    /// Current session, if logged in.
    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.info.read().await.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.info.read().await.is_some()
    }

    pub(crate) fn api_version(&self) -> &str {
        &self.settings.api_version
    }

    /// Logs in with the OAuth username-password flow against `login_url`.
    ///
    /// # Errors
    ///
    /// - `StreamError::LoginFailed` - Salesforce rejected the credentials
    /// - `StreamError::ConnectionFailed` - Network error
    pub async fn password_login(
        &self,
        login_url: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionInfo, StreamError> {
        let token_url = endpoint(login_url, "/services/oauth2/token")?;

        info!("[SFDC] Logging in as {}", username);

        let mut params = vec![
            ("grant_type", "password"),
            ("client_id", self.settings.client_id.as_str()),
            ("username", username),
            ("password", password.expose_secret()),
        ];
        if let Some(secret) = &self.settings.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }

        let request = self.http.post(token_url.as_str()).form(&params);
        let response = self.execute(request, &Method::POST, &token_url).await?;
        let status = response.status();

        if !status.is_success() {
            let reason = match response.json::<TokenErrorResponse>().await {
                Ok(body) => body.error_description.unwrap_or(body.error),
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            error!("[SFDC] Login failed: {}", status);
            return Err(StreamError::LoginFailed(reason));
        }

        let token: TokenResponse = response.json().await.map_err(|_| {
            error!("[SFDC] Failed to parse login response");
            StreamError::Internal("Invalid login response".to_string())
        })?;

        let info = SessionInfo {
            instance_url: token.instance_url,
            access_token: SecretString::from(token.access_token),
            identity_url: token.id,
        };
        *self.info.write().await = Some(info.clone());

        info!("[SFDC] Login successful");
        Ok(info)
    }

    /// Revokes the access token and forgets the session.
    ///
    /// # Errors
    ///
    /// - `StreamError::SalesforceError` - The revoke endpoint refused the token
    /// - `StreamError::ConnectionFailed` - Network error
    pub async fn revoke(&self) -> Result<(), StreamError> {
        let Some(info) = self.info.write().await.take() else {
            return Ok(());
        };

        let revoke_url = endpoint(&self.settings.login_url, "/services/oauth2/revoke")?;
        let request = self
            .http
            .post(revoke_url.as_str())
            .form(&[("token", info.access_token.expose_secret())]);
        let response = self.execute(request, &Method::POST, &revoke_url).await?;

        let status = response.status();
        if status.is_success() {
            info!("[SFDC] Logged out");
            Ok(())
        } else {
            warn!("[SFDC] Token revoke failed: {}", status);
            Err(StreamError::SalesforceError(format!(
                "Token revoke failed (HTTP {})",
                status.as_u16()
            )))
        }
    }

    /// Builds a full URL by joining `path` with the instance URL.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::NotAuthenticated` when not logged in.
    pub async fn build_url(&self, path: &str) -> Result<Url, StreamError> {
        let guard = self.info.read().await;
        let info = guard.as_ref().ok_or(StreamError::NotAuthenticated)?;
        endpoint(&info.instance_url, path)
    }

    /// Executes an authenticated request against the instance URL.
    ///
    /// Non-success statuses other than 401 and 429 are returned to the caller.
    ///
    /// # Errors
    ///
    /// - `StreamError::NotAuthenticated` - Not logged in
    /// - `StreamError::SessionExpired` - Salesforce answered 401
    /// - `StreamError::RateLimited` - Salesforce answered 429
    /// - `StreamError::ConnectionFailed` - Network error
    pub async fn request_authed(
        &self,
        method: Method,
        url: &Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, StreamError> {
        let token = {
            let guard = self.info.read().await;
            let info = guard.as_ref().ok_or(StreamError::NotAuthenticated)?;
            info.access_token.expose_secret().to_string()
        };

        let mut request = self.http.request(method.clone(), url.as_str()).bearer_auth(token);
        if let Some(body_bytes) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body_bytes);
        }

        let response = self.execute(request, &method, url).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => {
                warn!("[SFDC] Session rejected with 401");
                Err(StreamError::SessionExpired)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                warn!("[SFDC] Rate limited (retry after {:?}s)", retry_after_secs);
                Err(StreamError::RateLimited { retry_after_secs })
            }
            _ => Ok(response),
        }
    }

    /// Sends a request with timing and sanitized logging.
    ///
    /// Raw reqwest errors are never surfaced; they may contain full URLs.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        method: &Method,
        url: &Url,
    ) -> Result<reqwest::Response, StreamError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(url, self.logging_mode);

        let result = request.send().await;
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(response) => {
                let x_request_id = response
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                info!(
                    "[SFDC] {} {} {} {}ms {}",
                    method,
                    sanitized_url,
                    response.status().as_u16(),
                    duration_ms,
                    x_request_id
                );
                Ok(response)
            }
            Err(_) => {
                info!("[SFDC] {} {} FAILED {}ms", method, sanitized_url, duration_ms);
                Err(StreamError::ConnectionFailed(
                    "Connection to Salesforce failed".to_string(),
                ))
            }
        }
    }
}

impl Session for RestSession {
    fn login<'a>(
        &'a self,
        identity: &'a str,
        secret: &'a SecretString,
    ) -> BoxFuture<'a, Result<SessionInfo, StreamError>> {
        self.password_login(&self.settings.login_url, identity, secret)
            .boxed()
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), StreamError>> {
        self.revoke().boxed()
    }

    fn query(&self, soql: &str) -> RecordStream {
        self.query_records(soql)
    }
}

impl std::fmt::Debug for RestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSession")
            .field("settings", &self.settings)
            .field("logging_mode", &self.logging_mode)
            .finish_non_exhaustive()
    }
}

fn endpoint(base: &str, path: &str) -> Result<Url, StreamError> {
    let base = Url::parse(base)
        .map_err(|_| StreamError::Config(format!("Invalid Salesforce URL: {}", base)))?;
    base.join(path)
        .map_err(|_| StreamError::Internal(format!("Invalid path: {}", path)))
}

fn build_http_client() -> Result<reqwest::Client, StreamError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| StreamError::Internal(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(login_url: &str) -> SessionSettings {
        SessionSettings {
            login_url: login_url.to_string(),
            client_id: "3MVG9test".to_string(),
            ..SessionSettings::default()
        }
    }

    fn token_body(instance_url: &str, token: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": token,
            "instance_url": instance_url,
            "id": "https://login.salesforce.com/id/00Dxx0000001234/005xx0000001234",
            "token_type": "Bearer",
            "issued_at": "1700000000000"
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // URL sanitization
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn sanitize_strips_scheme_host_and_fragment() {
        let url = Url::parse("https://na1.salesforce.com/services/data/v60.0/query?q=x#frag").unwrap();

        assert_eq!(
            sanitize_url_for_logs(&url, LoggingMode::PathOnly),
            "/services/data/v60.0/query"
        );
        let with_query = sanitize_url_for_logs(&url, LoggingMode::PathAndQueryRedacted);
        assert!(!with_query.contains("na1.salesforce.com"));
        assert!(!with_query.contains("frag"));
    }

    #[test]
    fn sanitize_redacts_sensitive_params_case_insensitively() {
        let url = Url::parse(
            "https://login.salesforce.com/oauth?access_token=secret123&q=hello&SID=sess456&password=pw",
        )
        .unwrap();

        let result = sanitize_url_for_logs(&url, LoggingMode::PathAndQueryRedacted);

        assert!(result.contains("q=hello"));
        assert!(result.contains("access_token=***"));
        assert!(result.contains("SID=***"));
        assert!(result.contains("password=***"));
        assert!(!result.contains("secret123"));
        assert!(!result.contains("sess456"));
    }

    #[test]
    fn sensitive_params_require_exact_match() {
        assert!(is_sensitive_param("Client_Secret"));
        assert!(!is_sensitive_param("access_token_id"));
        assert!(!is_sensitive_param("tokens"));
        assert!(!is_sensitive_param("q"));
    }

    #[test]
    fn logging_mode_default_is_path_only() {
        assert_eq!(LoggingMode::default(), LoggingMode::PathOnly);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Login / logout
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn login_posts_password_grant_and_stores_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=integration"))
            .and(body_string_contains("client_id=3MVG9test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body(&server.uri(), "tok-1")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = RestSession::new(settings(&server.uri())).unwrap();
        assert!(!session.is_logged_in().await);

        let secret = SecretString::from("pw".to_string());
        let info = session.login("integration", &secret).await.unwrap();

        assert_eq!(info.instance_url, server.uri());
        assert_eq!(info.access_token.expose_secret(), "tok-1");
        assert!(session.is_logged_in().await);
    }

    #[tokio::test]
    async fn rejected_login_reports_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "authentication failure"
            })))
            .mount(&server)
            .await;

        let session = RestSession::new(settings(&server.uri())).unwrap();
        let err = session
            .login("integration", &SecretString::from("wrong".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(&err, StreamError::LoginFailed(msg) if msg == "authentication failure"));
        assert!(!session.is_logged_in().await);
    }

    #[tokio::test]
    async fn logout_revokes_token_and_forgets_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/revoke"))
            .and(body_string_contains("token=tok-9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let session = RestSession::new(settings(&server.uri())).unwrap();
        session
            .restore(SessionInfo {
                instance_url: server.uri(),
                access_token: SecretString::from("tok-9".to_string()),
                identity_url: None,
            })
            .await;

        session.logout().await.unwrap();
        assert!(!session.is_logged_in().await);

        // logging out again is a no-op
        session.logout().await.unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authenticated requests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn request_authed_requires_login() {
        let session = RestSession::new(SessionSettings::default()).unwrap();
        let url = Url::parse("https://na1.salesforce.com/services/data").unwrap();

        let result = session.request_authed(Method::GET, &url, None).await;
        assert!(matches!(result, Err(StreamError::NotAuthenticated)));
        assert!(matches!(
            session.build_url("/services/data").await,
            Err(StreamError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn request_authed_sends_bearer_and_maps_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("authorization", "Bearer tok-2"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/expired"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let session = RestSession::new(settings(&server.uri())).unwrap();
        session
            .restore(SessionInfo {
                instance_url: server.uri(),
                access_token: SecretString::from("tok-2".to_string()),
                identity_url: None,
            })
            .await;

        let ok = session.build_url("/ok").await.unwrap();
        let response = session.request_authed(Method::GET, &ok, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let expired = session.build_url("/expired").await.unwrap();
        assert!(matches!(
            session.request_authed(Method::GET, &expired, None).await,
            Err(StreamError::SessionExpired)
        ));

        let busy = session.build_url("/busy").await.unwrap();
        assert!(matches!(
            session.request_authed(Method::GET, &busy, None).await,
            Err(StreamError::RateLimited {
                retry_after_secs: Some(30)
            })
        ));
    }

    #[test]
    fn debug_does_not_leak_client_secret() {
        let session = RestSession::new(SessionSettings {
            client_secret: Some(SecretString::from("very-secret".to_string())),
            ..SessionSettings::default()
        })
        .unwrap();
        assert!(!format!("{:?}", session).contains("very-secret"));
    }
}
