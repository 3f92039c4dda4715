use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::login::{HttpLoginExchange, LoginExchange};
use super::store::{SqliteTokenStore, TokenStore};
use super::types::{Credential, CredentialSource, LoginCredentials, PersistedToken};
use crate::config::Config;
use crate::error::{CredentialUnavailable, SourceAttempt, SourceError};
use crate::utils::user_agent;

/// Request headers, ordered by name
pub type Headers = BTreeMap<String, String>;

/// Refresh sources in priority order
const REFRESH_CHAIN: [CredentialSource; 4] = [
    CredentialSource::Environment,
    CredentialSource::PersistedFile,
    CredentialSource::LoginResponse,
    CredentialSource::FallbackDefault,
];

/// Convert a configured number of seconds into a policy duration
fn seconds(name: &str, secs: u64) -> Result<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .with_context(|| format!("{} is out of range: {} seconds", name, secs))
}

/// Timing knobs for credential refresh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    /// Refresh this long before a known expiry (default: 5 minutes)
    pub refresh_threshold: Duration,

    /// Assumed lifetime of a login token when the server reports no expiry
    pub default_ttl: Duration,

    /// How long a credential with unknown expiry is reused before re-checking sources
    pub unknown_expiry_ttl: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::seconds(300),
            default_ttl: Duration::seconds(3600),
            unknown_expiry_ttl: Duration::seconds(300),
        }
    }
}

/// Service/project identification added to every header set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderIdentity {
    pub service_name: Option<String>,
    pub project_id: Option<String>,
}

/// Credential manager
/// Keeps one cached bearer credential and refreshes it through the source chain
pub struct CredentialManager {
    /// Current credential, replaced wholesale on refresh
    current: RwLock<Option<Arc<Credential>>>,

    /// Token values the API answered 401 to
    rejected: RwLock<HashSet<String>>,

    external_token: Option<String>,
    store: Option<Arc<dyn TokenStore>>,
    login: Option<(Arc<dyn LoginExchange>, LoginCredentials)>,
    fallback_token: Option<String>,

    policy: RefreshPolicy,
    identity: HeaderIdentity,
}

/// Builder for [`CredentialManager`]; every source is optional
#[derive(Default)]
pub struct CredentialManagerBuilder {
    external_token: Option<String>,
    store: Option<Arc<dyn TokenStore>>,
    login: Option<(Arc<dyn LoginExchange>, LoginCredentials)>,
    fallback_token: Option<String>,
    policy: RefreshPolicy,
    identity: HeaderIdentity,
}

impl CredentialManagerBuilder {
    /// Source 1: token supplied at process start
    pub fn external_token(mut self, token: impl Into<String>) -> Self {
        self.external_token = Some(token.into());
        self
    }

    /// Source 2: token persisted by a previous run (also written after each login)
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Source 3: username/password exchange
    pub fn login(
        mut self,
        exchange: Arc<dyn LoginExchange>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let credentials = LoginCredentials {
            username: username.into(),
            password: password.into(),
        };
        self.login = Some((exchange, credentials));
        self
    }

    /// Source 4: static last-resort token
    pub fn fallback_token(mut self, token: impl Into<String>) -> Self {
        self.fallback_token = Some(token.into());
        self
    }

    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(mut self, identity: HeaderIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn build(self) -> CredentialManager {
        CredentialManager {
            current: RwLock::new(None),
            rejected: RwLock::new(HashSet::new()),
            external_token: self.external_token,
            store: self.store,
            login: self.login,
            fallback_token: self.fallback_token,
            policy: self.policy,
            identity: self.identity,
        }
    }
}

impl CredentialManager {
    pub fn builder() -> CredentialManagerBuilder {
        CredentialManagerBuilder::default()
    }

    /// Create a CredentialManager wired to the configured sources
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder()
            .policy(RefreshPolicy {
                refresh_threshold: seconds("TOKEN_REFRESH_THRESHOLD", config.token_refresh_threshold)?,
                default_ttl: seconds("TOKEN_DEFAULT_TTL", config.token_default_ttl)?,
                unknown_expiry_ttl: seconds(
                    "TOKEN_UNKNOWN_EXPIRY_TTL",
                    config.token_unknown_expiry_ttl,
                )?,
            })
            .identity(HeaderIdentity {
                service_name: config.service_name.clone(),
                project_id: config.project_id.clone(),
            });

        if let Some(ref token) = config.api_token {
            builder = builder.external_token(token.clone());
        }

        if let Some(ref path) = config.token_store_file {
            tracing::debug!("Using token store: {}", path.display());
            builder = builder.token_store(Arc::new(SqliteTokenStore::new(path.clone())));
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            let exchange = HttpLoginExchange::new(
                config.login_url(),
                std::time::Duration::from_secs(config.login_timeout),
            )?;
            builder = builder.login(Arc::new(exchange), username.clone(), password.clone());
        }

        if let Some(ref token) = config.fallback_token {
            builder = builder.fallback_token(token.clone());
        }

        Ok(builder.build())
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Currently cached credential, without any refresh
    pub async fn current(&self) -> Option<Arc<Credential>> {
        self.current.read().await.clone()
    }

    /// Get a valid credential, refreshing if necessary
    pub async fn get_valid_credential(&self) -> Result<Arc<Credential>, CredentialUnavailable> {
        let cached = self.current().await;

        if let Some(ref credential) = cached {
            if !self.needs_refresh(credential) {
                return Ok(Arc::clone(credential));
            }
            tracing::debug!(
                source = %credential.source(),
                "Credential is near expiry, refreshing"
            );
        }

        match self.refresh().await {
            Ok(credential) => Ok(credential),
            Err(e) => {
                // Graceful degradation: if the cached credential isn't actually expired yet, use it
                if let Some(credential) = cached {
                    let rejected = self.rejected.read().await.contains(credential.value());
                    if !rejected && !credential.is_expired(Utc::now()) {
                        tracing::warn!(
                            "Using existing credential despite refresh failure (not yet expired)"
                        );
                        return Ok(credential);
                    }
                }
                Err(e)
            }
        }
    }

    /// Walk the source chain and cache the first credential obtained
    pub async fn refresh(&self) -> Result<Arc<Credential>, CredentialUnavailable> {
        tracing::debug!("Refreshing credential...");

        let rejected = self.rejected.read().await.clone();
        let mut attempts = Vec::new();

        for source in REFRESH_CHAIN {
            let outcome = match source {
                CredentialSource::Environment => {
                    self.static_token(self.external_token.as_deref(), source, &rejected)
                }
                CredentialSource::PersistedFile => self.from_store(&rejected),
                CredentialSource::LoginResponse => self.from_login().await,
                CredentialSource::FallbackDefault => {
                    self.static_token(self.fallback_token.as_deref(), source, &rejected)
                }
            };

            match outcome {
                Ok(Some(credential)) => {
                    let credential = Arc::new(credential);
                    *self.current.write().await = Some(Arc::clone(&credential));

                    tracing::info!(
                        source = %source,
                        expires_at = ?credential.expires_at(),
                        "Credential acquired ({})",
                        credential.masked()
                    );
                    return Ok(credential);
                }
                Ok(None) => {
                    tracing::debug!("Refresh source {} is not configured", source);
                    attempts.push(SourceAttempt {
                        source,
                        error: SourceError::NotConfigured,
                    });
                }
                Err(error) => {
                    tracing::warn!("Refresh source {} failed: {}", source, error);
                    attempts.push(SourceAttempt { source, error });
                }
            }
        }

        let err = CredentialUnavailable { attempts };
        tracing::error!("{}", err);
        Err(err)
    }

    /// Drop the cached credential so the next call refreshes
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
        tracing::debug!("Cached credential invalidated");
    }

    /// Record that the API answered 401 to `credential`.
    ///
    /// Its value is never re-selected from the environment, the store or the
    /// fallback. The cache is only dropped while it still holds that value, so
    /// a late 401 for an already replaced credential leaves the replacement alone.
    pub async fn reject(&self, credential: &Credential) {
        let newly_rejected = self
            .rejected
            .write()
            .await
            .insert(credential.value().to_string());
        if newly_rejected {
            tracing::warn!(
                source = %credential.source(),
                "Credential {} was rejected by the API",
                credential.masked()
            );
        }

        let mut current = self.current.write().await;
        if current
            .as_ref()
            .is_some_and(|cached| cached.value() == credential.value())
        {
            *current = None;
        }
    }

    /// Build the standard header set, then overlay `extra` (caller wins, names
    /// compared case-insensitively)
    pub async fn build_headers<I, K, V>(&self, extra: I) -> Result<Headers, CredentialUnavailable>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let extra: Vec<(String, String)> = extra
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let credential = self.get_valid_credential().await?;
        Ok(self.headers_for(&credential, extra))
    }

    /// Standard header set for a given credential, with `extra` overlaid
    pub fn headers_for<I, K, V>(&self, credential: &Credential, extra: I) -> Headers
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = Headers::new();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", credential.value()),
        );
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("User-Agent".to_string(), user_agent());

        if let Some(ref service) = self.identity.service_name {
            headers.insert("X-Service-Name".to_string(), service.clone());
        }
        if let Some(ref project) = self.identity.project_id {
            headers.insert("X-Project-Id".to_string(), project.clone());
        }

        for (name, value) in extra {
            let name = name.into();
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            headers.insert(name, value.into());
        }

        headers
    }

    fn needs_refresh(&self, credential: &Credential) -> bool {
        credential.needs_refresh(
            Utc::now(),
            self.policy.refresh_threshold,
            self.policy.unknown_expiry_ttl,
        )
    }

    /// Sources 1 and 4: a fixed value with unknown expiry
    fn static_token(
        &self,
        token: Option<&str>,
        source: CredentialSource,
        rejected: &HashSet<String>,
    ) -> Result<Option<Credential>, SourceError> {
        let Some(token) = token else {
            return Ok(None);
        };

        let token = token.trim();
        if token.is_empty() {
            return Err(SourceError::Empty);
        }
        if rejected.contains(token) {
            return Err(SourceError::PreviouslyRejected);
        }

        if source == CredentialSource::FallbackDefault {
            tracing::warn!("Using static fallback credential; it may already be expired");
        }

        Ok(Some(Credential::new(token, source, None)))
    }

    /// Source 2: token persisted by a previous login
    fn from_store(&self, rejected: &HashSet<String>) -> Result<Option<Credential>, SourceError> {
        let Some(ref store) = self.store else {
            return Ok(None);
        };

        let record = store
            .load()
            .map_err(|e| SourceError::Store(format!("{:#}", e)))?
            .ok_or(SourceError::Missing)?;

        let token = record.access_token.trim();
        if token.is_empty() {
            return Err(SourceError::Empty);
        }
        if rejected.contains(token) {
            return Err(SourceError::PreviouslyRejected);
        }

        if let (Some(acquired_at), Some(expires_at)) = (record.acquired_at, record.expires_at) {
            if expires_at < acquired_at {
                return Err(SourceError::Malformed(format!(
                    "expires at {} before it was acquired at {}",
                    expires_at.to_rfc3339(),
                    acquired_at.to_rfc3339()
                )));
            }
        }

        // A record already inside the refresh window would be refreshed on the next call anyway
        if let Some(expires_at) = record.expires_at {
            let due = Utc::now()
                .checked_add_signed(self.policy.refresh_threshold)
                .map_or(true, |limit| expires_at <= limit);
            if due {
                return Err(SourceError::Expired(expires_at));
            }
        }

        Ok(Some(Credential::new(
            token,
            CredentialSource::PersistedFile,
            record.expires_at,
        )))
    }

    /// Source 3: login exchange, persisted on success
    async fn from_login(&self) -> Result<Option<Credential>, SourceError> {
        let Some((ref exchange, ref login)) = self.login else {
            return Ok(None);
        };

        let grant = exchange.login(&login.username, &login.password).await?;
        if grant.access_token.trim().is_empty() {
            return Err(SourceError::Empty);
        }

        let expires_at = match grant.expires_at {
            Some(expires_at) => expires_at,
            None => Utc::now()
                .checked_add_signed(self.policy.default_ttl)
                .ok_or_else(|| SourceError::Malformed("default TTL out of range".to_string()))?,
        };
        let credential = Credential::new(
            grant.access_token,
            CredentialSource::LoginResponse,
            Some(expires_at),
        );

        // A freshly issued token is trusted even if it matches an old rejection
        self.rejected.write().await.remove(credential.value());

        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&PersistedToken::from(&credential)) {
                tracing::warn!("Failed to persist credential: {:#}", e);
            }
        }

        Ok(Some(credential))
    }
}
