// Username/password login exchange

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;

use super::types::{LoginGrant, LoginRequest, LoginResponse};
use crate::error::LoginError;
use crate::utils::{transport_error_kind, user_agent};

/// Exchange of username/password for a bearer token
pub trait LoginExchange: Send + Sync {
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, std::result::Result<LoginGrant, LoginError>>;
}

/// Login exchange against the platform's auth endpoint
pub struct HttpLoginExchange {
    client: Client,
    url: String,
}

impl HttpLoginExchange {
    /// Create a login exchange; `timeout` bounds the whole request
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn exchange(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<LoginGrant, LoginError> {
        tracing::info!("Requesting access token via login exchange...");
        tracing::debug!(url = %self.url, username = username, "Login request");

        let request = LoginRequest { username, password };

        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", user_agent())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                LoginError::Transport(format!("{} ({})", e, transport_error_kind(&e)))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(
                "Login exchange failed: status={}, body={}",
                status,
                error_text
            );
            return Err(LoginError::Rejected {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let body = response.text().await.map_err(|e| {
            LoginError::Transport(format!("{} ({})", e, transport_error_kind(&e)))
        })?;

        let data: LoginResponse = serde_json::from_str(&body)
            .map_err(|e| LoginError::Malformed(format!("invalid JSON: {}", e)))?;

        let access_token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                LoginError::Malformed("response does not contain an access token".to_string())
            })?;

        let expires_at = match (data.expires_in, data.expires_at) {
            (Some(expires_in), _) => Some(
                Duration::try_seconds(expires_in.max(0))
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                    .ok_or_else(|| LoginError::Malformed("expires_in out of range".to_string()))?,
            ),
            (None, Some(raw)) => Some(
                parse_datetime(&raw).map_err(|e| LoginError::Malformed(format!("{:#}", e)))?,
            ),
            (None, None) => None,
        };

        match expires_at {
            Some(exp) => tracing::info!("Login succeeded, token expires: {}", exp.to_rfc3339()),
            None => tracing::info!("Login succeeded, server did not report an expiry"),
        }

        Ok(LoginGrant {
            access_token,
            expires_at,
        })
    }
}

impl LoginExchange for HttpLoginExchange {
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, std::result::Result<LoginGrant, LoginError>> {
        self.exchange(username, password).boxed()
    }
}

/// Parse datetime from various ISO 8601 formats
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    // Handle Z suffix
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse datetime: {}", s))
}
