// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a credential came from, in refresh priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Token injected at process start (API_TOKEN / --token)
    Environment,

    /// Token written to the local store by a previous login
    PersistedFile,

    /// Token returned by the username/password exchange
    LoginResponse,

    /// Statically configured last resort, possibly expired
    FallbackDefault,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CredentialSource::Environment => "environment",
            CredentialSource::PersistedFile => "persisted store",
            CredentialSource::LoginResponse => "login exchange",
            CredentialSource::FallbackDefault => "fallback default",
        };
        f.write_str(name)
    }
}

/// Bearer credential. Never mutated once built; a refresh produces a new one.
#[derive(Clone, PartialEq)]
pub struct Credential {
    value: String,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    source: CredentialSource,
}

impl Credential {
    /// Create a credential acquired now
    pub fn new(
        value: impl Into<String>,
        source: CredentialSource,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::acquired_at(value, source, Utc::now(), expires_at)
    }

    /// Create a credential with an explicit acquisition time.
    /// An expiry earlier than the acquisition time is clamped to it.
    pub fn acquired_at(
        value: impl Into<String>,
        source: CredentialSource,
        acquired_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            value: value.into(),
            acquired_at,
            expires_at: expires_at.map(|exp| exp.max(acquired_at)),
            source,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn acquired(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Known expiry, `None` when the provider did not say
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Check if the credential is past its known expiry.
    /// Unknown expiry is never reported as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }

    /// Check if the credential should be replaced.
    ///
    /// Known expiry: within `threshold` of expiring.
    /// Unknown expiry: held for longer than `unknown_ttl`.
    pub fn needs_refresh(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
        unknown_ttl: Duration,
    ) -> bool {
        match self.expires_at {
            Some(exp) => now
                .checked_add_signed(threshold)
                .map_or(true, |limit| exp <= limit),
            None => self
                .acquired_at
                .checked_add_signed(unknown_ttl)
                .map_or(false, |due| now >= due),
        }
    }

    /// First characters of the token, safe to print
    pub fn masked(&self) -> String {
        let prefix: String = self.value.chars().take(8).collect();
        format!("{}...", prefix)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("value", &self.masked())
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

/// Username/password pair for the login exchange
#[derive(Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Token data from a successful login exchange
#[derive(Debug, Clone, PartialEq)]
pub struct LoginGrant {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Login response body (services disagree on field casing)
#[derive(Deserialize)]
pub struct LoginResponse {
    #[serde(alias = "accessToken", alias = "token")]
    pub access_token: Option<String>,
    #[serde(alias = "expiresIn")]
    pub expires_in: Option<i64>,
    #[serde(alias = "expiresAt")]
    pub expires_at: Option<String>,
}

/// Token record kept in the local key-value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedToken {
    pub access_token: String,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for PersistedToken {
    fn from(credential: &Credential) -> Self {
        Self {
            access_token: credential.value().to_string(),
            acquired_at: Some(credential.acquired()),
            expires_at: credential.expires_at(),
        }
    }
}
