// Error handling module
// Defines the error taxonomy for credentials, tracking and resource calls

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::auth::CredentialSource;

/// Failure of the username/password login exchange
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoginError {
    /// Server answered with a non-success status (bad credentials, locked account...)
    #[error("rejected by server ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Request never produced a response (connect failure, timeout, TLS)
    #[error("transport error: {0}")]
    Transport(String),

    /// Response arrived but did not carry a usable token
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Why a single refresh source did not produce a credential
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("not configured")]
    NotConfigured,

    #[error("nothing persisted")]
    Missing,

    #[error("empty value")]
    Empty,

    #[error("malformed value: {0}")]
    Malformed(String),

    #[error("expired at {}", .0.to_rfc3339())]
    Expired(DateTime<Utc>),

    #[error("value was already rejected by the API")]
    PreviouslyRejected,

    #[error("store error: {0}")]
    Store(String),

    #[error("login {0}")]
    Login(#[from] LoginError),
}

/// One entry of the refresh chain report
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttempt {
    pub source: CredentialSource,
    pub error: SourceError,
}

impl std::fmt::Display for SourceAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.source, self.error)
    }
}

/// Every refresh source failed; no Authorization header can be built
#[derive(Error, Debug, Clone, PartialEq)]
#[error("no credential available; tried {}", describe_attempts(.attempts))]
pub struct CredentialUnavailable {
    pub attempts: Vec<SourceAttempt>,
}

impl CredentialUnavailable {
    /// Error reported for a given source, if it was attempted
    pub fn reason_for(&self, source: CredentialSource) -> Option<&SourceError> {
        self.attempts
            .iter()
            .find(|a| a.source == source)
            .map(|a| &a.error)
    }
}

fn describe_attempts(attempts: &[SourceAttempt]) -> String {
    if attempts.is_empty() {
        return "no sources".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Programmer errors when registering resources for cleanup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("resource kind must not be empty")]
    EmptyKind,

    #[error("cannot track {kind} with an empty identifier")]
    EmptyIdentifier { kind: String },
}

/// Errors returned by the resource API client
#[derive(Error, Debug)]
pub enum ClientError {
    /// No credential could be obtained for the request
    #[error("authentication failed: {0}")]
    Auth(#[from] CredentialUnavailable),

    /// Resource does not exist (HTTP 404)
    #[error("not found")]
    NotFound,

    /// Any other non-success response
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Request could not be sent or the body could not be read
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Header name or value cannot be put on the wire
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Creation response carried no identifier
    #[error("response does not contain an id: {0}")]
    MissingId(String),

    /// Created resource could not be registered for cleanup
    #[error("tracking error: {0}")]
    Tracking(#[from] TrackingError),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
