use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialManager, Headers};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::tracker::{ResourceDeleter, ResourceId};
use crate::utils::transport_error_kind;

/// Kinds whose collection path is not a regular plural
const IRREGULAR_ROUTES: &[(&str, &str)] = &[
    ("response_scenario", "response-scenarios"),
    ("water_transport", "water-transport"),
    ("metro_transport", "metro-transport"),
    ("external_transport", "external-transport"),
];

/// Generic client for the platform's resource collections
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Source of Authorization headers
    credentials: Arc<CredentialManager>,

    base_url: Url,

    /// Per-kind collection path overrides
    routes: HashMap<String, String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        credentials: Arc<CredentialManager>,
        base_url: impl Into<String>,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .with_context(|| format!("Invalid API base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API base URL cannot carry resource paths: {}", base_url);
        }

        let routes = IRREGULAR_ROUTES
            .iter()
            .map(|(kind, path)| (kind.to_string(), path.to_string()))
            .collect();

        Ok(Self {
            client,
            credentials,
            base_url,
            routes,
        })
    }

    pub fn from_config(credentials: Arc<CredentialManager>, config: &Config) -> anyhow::Result<Self> {
        Self::new(credentials, config.base_url.clone(), config.http_request_timeout)
    }

    /// Override the collection path used for `kind`
    pub fn with_route(mut self, kind: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into().trim_matches('/').to_string();
        self.routes.insert(kind.into(), path);
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn collection_url(&self, kind: &str) -> String {
        let path = self.collection_path(kind);
        self.url_with(path.split('/'))
    }

    /// Resource URL; the identifier is a single percent-encoded path segment
    pub fn resource_url(&self, kind: &str, identifier: &ResourceId) -> String {
        let path = self.collection_path(kind);
        let identifier = identifier.to_string();
        self.url_with(path.split('/').chain(std::iter::once(identifier.as_str())))
    }

    fn collection_path(&self, kind: &str) -> String {
        self.routes
            .get(kind)
            .cloned()
            .unwrap_or_else(|| default_collection_path(kind))
    }

    fn url_with<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> String {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL always has path segments
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.into()
    }

    /// Send an authorized request and return the raw response.
    ///
    /// `extra` headers override the defaults. On 401 the credential is
    /// rejected and the request re-sent once, unless the caller supplied its
    /// own Authorization header.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        extra: &[(String, String)],
    ) -> Result<Response> {
        let overrides_auth = extra
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        let mut retried = false;

        loop {
            let credential = self.credentials.get_valid_credential().await?;
            let headers = self.credentials.headers_for(&credential, extra.iter().cloned());

            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(to_header_map(&headers)?);
            if let Some(body) = body {
                request = request.json(body);
            }

            tracing::debug!(method = %method, url = %url, "Sending HTTP request");

            let response = request.send().await.map_err(|e| {
                tracing::warn!(
                    error_kind = transport_error_kind(&e),
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                ClientError::Transport(e)
            })?;

            let status = response.status();
            tracing::debug!(status = %status, "Received HTTP response");

            if status == StatusCode::UNAUTHORIZED && !overrides_auth && !retried {
                tracing::warn!("Received 401, refreshing credential and retrying...");
                self.credentials.reject(&credential).await;
                retried = true;
                continue;
            }

            return Ok(response);
        }
    }

    /// Create a resource and return the identifier from the response
    pub async fn create(&self, kind: &str, body: &Value) -> Result<ResourceId> {
        let url = self.collection_url(kind);
        let response = self.execute(Method::POST, &url, Some(body), &[]).await?;
        let created: Value = check_status(response).await?.json().await?;

        let identifier = ResourceId::from_json(&created["id"])
            .or_else(|| ResourceId::from_json(&created["data"]["id"]))
            .ok_or_else(|| ClientError::MissingId(created.to_string()))?;

        tracing::debug!(kind = kind, identifier = %identifier, "Created resource");
        Ok(identifier)
    }

    /// Fetch a single resource
    pub async fn fetch(&self, kind: &str, identifier: &ResourceId) -> Result<Value> {
        let url = self.resource_url(kind, identifier);
        let response = self.execute(Method::GET, &url, None, &[]).await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Delete a single resource; 404 is reported as [`ClientError::NotFound`]
    pub async fn delete(&self, kind: &str, identifier: &ResourceId) -> Result<()> {
        let url = self.resource_url(kind, identifier);
        let response = self.execute(Method::DELETE, &url, None, &[]).await?;
        check_status(response).await?;
        tracing::debug!(kind = kind, identifier = %identifier, "Deleted resource");
        Ok(())
    }
}

impl ResourceDeleter for ApiClient {
    type Error = ClientError;

    async fn delete(&self, kind: &str, identifier: &ResourceId) -> Result<()> {
        ApiClient::delete(self, kind, identifier).await
    }
}

/// Map non-success responses to errors
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound);
    }

    let error_text = response.text().await.unwrap_or_default();
    tracing::error!(
        status = status.as_u16(),
        response_body = %error_text,
        "API request failed with error response"
    );
    Err(ClientError::Status {
        status: status.as_u16(),
        message: error_text,
    })
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ClientError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| ClientError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Collection path for a kind: `category` -> `categories`, `route` -> `routes`
fn default_collection_path(kind: &str) -> String {
    let kind = kind.trim().replace('_', "-");

    if let Some(stem) = kind.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{}ies", stem);
        }
    }
    if kind.ends_with('s') || kind.ends_with('x') || kind.ends_with("ch") || kind.ends_with("sh") {
        return format!("{}es", kind);
    }
    format!("{}s", kind)
}
