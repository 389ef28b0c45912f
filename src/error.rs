use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "refresh_token",
    "access_token",
    "client_secret",
    "password",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for the command line.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Dispatch ──────────────────────────────────────────────────────────────
    #[error("Unsupported data format: {0}")]
    UnsupportedFormat(String),

    // ── Stages ────────────────────────────────────────────────────────────────
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Invalid CSV: {0}")]
    CsvInvalid(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    // ── Stream lifecycle ──────────────────────────────────────────────────────
    #[error("Stream closed")]
    Closed,

    #[error("Records are already subscribed on this stream")]
    AlreadySubscribed,

    #[error("Operation cancelled")]
    Cancelled,

    // ── Session ───────────────────────────────────────────────────────────────
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired")]
    SessionExpired,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Salesforce error: {0}")]
    SalesforceError(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No credentials in session pool")]
    NoCredentials,

    // ── Config / IO ───────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Builds a `StageFailed` error for the named stage.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        StreamError::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Converts the error into a presentation suitable for display.
    /// Never leaks secrets, tokens, or sensitive URL parameters.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── Dispatch ──────────────────────────────────────────────────────
            StreamError::UnsupportedFormat(format) => ErrorPresentation {
                title: "Unsupported Format".into(),
                message: format!("No converter is registered for the '{}' format.", format),
                action: Some("Use a registered format such as csv".into()),
            },

            // ── Stages ────────────────────────────────────────────────────────
            StreamError::StageFailed { stage, message } => ErrorPresentation {
                title: "Pipeline Stage Failed".into(),
                message: format!(
                    "Stage '{}' stopped the pipeline: {}",
                    stage,
                    sanitize_message(message, "the stage reported an error")
                ),
                action: Some("Check the mapping or filter and try again".into()),
            },

            StreamError::CsvInvalid(msg) => ErrorPresentation {
                title: "Invalid CSV".into(),
                message: format!("The CSV input has a formatting problem: {}", msg),
                action: Some("Fix the CSV input and try again".into()),
            },

            StreamError::Serialization(msg) => ErrorPresentation {
                title: "Serialization Error".into(),
                message: format!("Records could not be serialized: {}", msg),
                action: None,
            },

            // ── Stream lifecycle ──────────────────────────────────────────────
            StreamError::Closed => ErrorPresentation {
                title: "Stream Closed".into(),
                message: "The stream was closed before the data could be delivered.".into(),
                action: None,
            },

            StreamError::AlreadySubscribed => ErrorPresentation {
                title: "Already Subscribed".into(),
                message: "Records from this stream are already being consumed.".into(),
                action: None,
            },

            StreamError::Cancelled => ErrorPresentation {
                title: "Cancelled".into(),
                message: "The operation was cancelled.".into(),
                action: None,
            },

            // ── Session ───────────────────────────────────────────────────────
            StreamError::NotAuthenticated => ErrorPresentation {
                title: "Not Logged In".into(),
                message: "You need to log in to Salesforce to continue.".into(),
                action: Some("Log in to Salesforce".into()),
            },

            StreamError::SessionExpired => ErrorPresentation {
                title: "Session Expired".into(),
                message: "Your Salesforce session has expired.".into(),
                action: Some("Log in again".into()),
            },

            StreamError::LoginFailed(reason) => ErrorPresentation {
                title: "Login Failed".into(),
                message: format!(
                    "Salesforce rejected the login: {}",
                    sanitize_message(reason, "check the configured credentials")
                ),
                action: Some("Verify credentials and log in again".into()),
            },

            StreamError::SalesforceError(msg) => ErrorPresentation {
                title: "Salesforce Error".into(),
                message: sanitize_message(msg, "A Salesforce error occurred."),
                action: None,
            },

            StreamError::RateLimited { retry_after_secs } => {
                let wait_msg = match retry_after_secs {
                    Some(secs) => format!("Please wait {} seconds before trying again.", secs),
                    None => "Please wait a moment before trying again.".into(),
                };
                ErrorPresentation {
                    title: "Too Many Requests".into(),
                    message: format!("Salesforce is limiting requests. {}", wait_msg),
                    action: Some("Wait and retry".into()),
                }
            }

            StreamError::ConnectionFailed(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message: "Could not connect to Salesforce. Please check your internet connection.".into(),
                action: Some("Check network and retry".into()),
            },

            StreamError::NoCredentials => ErrorPresentation {
                title: "No Credentials".into(),
                message: "The session pool has no credentials to log in with.".into(),
                action: Some("Add credentials to the configuration file".into()),
            },

            // ── Config / IO ───────────────────────────────────────────────────
            StreamError::Config(msg) => ErrorPresentation {
                title: "Configuration Error".into(),
                message: sanitize_message(msg, "The configuration could not be loaded."),
                action: Some("Fix the configuration and try again".into()),
            },

            StreamError::Io(msg) => ErrorPresentation {
                title: "File Error".into(),
                message: msg.clone(),
                action: Some("Check the file path and permissions".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            StreamError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Io(e.to_string())
    }
}

impl From<csv::Error> for StreamError {
    fn from(e: csv::Error) -> Self {
        StreamError::CsvInvalid(e.to_string())
    }
}
