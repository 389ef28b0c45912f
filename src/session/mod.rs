//! Salesforce sessions: login, authenticated requests, paged queries, and a
//! round-robin pool over several credentials.
//!
//! Key features:
//!
//! - **Secret handling** via `secrecy::SecretString`; passwords and tokens are
//!   redacted from `Debug` output and never logged
//! - **Safe logging** of request URLs (`sanitize_url_for_logs`)
//! - **Lazy queries** returned as a `RecordStream` that fetches the next page
//!   only when the consumer pulls past the current one
//! - **No retries**: a 401 surfaces as `StreamError::SessionExpired`

mod client;
mod pool;
mod query;

use std::fmt;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::StreamError;
use crate::stream::RecordStream;

pub use client::{sanitize_url_for_logs, LoggingMode, RestSession};
pub use pool::SessionPool;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Production login endpoint.
pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";

/// REST API version used for queries.
pub const DEFAULT_API_VERSION: &str = "v60.0";

// ─────────────────────────────────────────────────────────────────────────────
// Session trait
// ─────────────────────────────────────────────────────────────────────────────

/// A connection that can log in, issue queries, and log out.
pub trait Session: Send + Sync {
    /// Logs in with a username (`identity`) and password (`secret`).
    fn login<'a>(
        &'a self,
        identity: &'a str,
        secret: &'a SecretString,
    ) -> BoxFuture<'a, Result<SessionInfo, StreamError>>;

    /// Ends the session. A session that never logged in logs out trivially.
    fn logout(&self) -> BoxFuture<'_, Result<(), StreamError>>;

    /// Streams the records matching `soql`.
    fn query(&self, soql: &str) -> RecordStream;
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionSettings
// ─────────────────────────────────────────────────────────────────────────────

/// Connected-app and endpoint settings shared by every session.
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Login endpoint (e.g. `https://test.salesforce.com` for sandboxes).
    pub login_url: String,
    /// REST API version, with the leading `v`.
    pub api_version: String,
    /// OAuth client id of the connected app.
    pub client_id: String,
    /// OAuth client secret of the connected app, if it requires one.
    #[serde(deserialize_with = "deserialize_optional_secret")]
    pub client_secret: Option<SecretString>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            client_id: String::new(),
            client_secret: None,
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("login_url", &self.login_url)
            .field("api_version", &self.api_version)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential
// ─────────────────────────────────────────────────────────────────────────────

/// One username/password pair of a session pool.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Overrides `SessionSettings::login_url` for this credential.
    #[serde(default)]
    pub login_url: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
            login_url: None,
        }
    }

    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = Some(login_url.into());
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("login_url", &self.login_url)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionInfo
// ─────────────────────────────────────────────────────────────────────────────

/// An established session.
#[derive(Clone)]
pub struct SessionInfo {
    /// Instance URL requests are sent to (e.g. "https://na1.salesforce.com").
    pub instance_url: String,
    /// OAuth access token.
    pub access_token: SecretString,
    /// Identity URL returned at login, naming the org and user.
    pub identity_url: Option<String>,
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("instance_url", &self.instance_url)
            .field("access_token", &"[REDACTED]")
            .field("identity_url", &self.identity_url)
            .finish()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|s| s.map(SecretString::from))
}
