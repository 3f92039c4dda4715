use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Transport API harness - credential and cleanup tooling for the API test suite
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the platform API
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Login endpoint (absolute URL or path relative to the base URL)
    #[arg(long, env = "AUTH_LOGIN_URL", default_value = "/auth/login")]
    pub login_url: String,

    /// Bearer token supplied up front (first refresh source)
    #[arg(short = 't', long, env = "API_TOKEN")]
    pub token: Option<String>,

    /// Username for the login exchange
    #[arg(long, env = "API_USERNAME")]
    pub username: Option<String>,

    /// Password for the login exchange
    #[arg(long, env = "API_PASSWORD")]
    pub password: Option<String>,

    /// Last-resort static token, may be expired
    #[arg(long, env = "API_FALLBACK_TOKEN")]
    pub fallback_token: Option<String>,

    /// Path to the SQLite token store
    #[arg(short = 'd', long, env = "TOKEN_STORE_FILE")]
    pub token_store: Option<String>,

    /// Do not read or write the token store
    #[arg(long)]
    pub no_token_store: bool,

    /// Service name sent as X-Service-Name
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Project identifier sent as X-Project-Id
    #[arg(long, env = "PROJECT_ID")]
    pub project_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Acquire a credential and show where it came from
    Token,

    /// Print the header set a resource client would send
    Headers {
        /// Extra header overriding the defaults (NAME=VALUE)
        #[arg(short = 'H', long = "header", value_parser = parse_header_pair)]
        headers: Vec<(String, String)>,

        /// Print the Authorization value unmasked
        #[arg(long)]
        reveal: bool,
    },

    /// Delete resources left behind by an interrupted run
    Cleanup {
        /// Resource kind (category, keyword, station, ...)
        kind: String,

        /// Identifiers to delete
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

/// Upper bound for every duration setting: ten years
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    // API target
    pub base_url: String,
    pub login_url: String,

    // Credential sources
    pub api_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub fallback_token: Option<String>,
    pub token_store_file: Option<PathBuf>,

    // Header identity
    pub service_name: Option<String>,
    pub project_id: Option<String>,

    // Timeouts (seconds)
    pub token_refresh_threshold: u64,
    pub token_default_ttl: u64,
    pub token_unknown_expiry_ttl: u64,
    pub login_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let token_store_file = if args.no_token_store {
            None
        } else {
            args.token_store
                .map(|s| expand_tilde(&s))
                .or_else(default_token_store)
        };

        let config = Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),
            login_url: args.login_url,

            api_token: non_empty(args.token),
            username: non_empty(args.username),
            password: args.password,
            fallback_token: non_empty(args.fallback_token),
            token_store_file,

            service_name: non_empty(args.service_name),
            project_id: non_empty(args.project_id),

            token_refresh_threshold: env_u64("TOKEN_REFRESH_THRESHOLD", 300)?,
            token_default_ttl: env_u64("TOKEN_DEFAULT_TTL", 3600)?,
            token_unknown_expiry_ttl: env_u64("TOKEN_UNKNOWN_EXPIRY_TTL", 300)?,
            login_timeout: env_u64("LOGIN_TIMEOUT", 30)?,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.base_url))?;
        reqwest::Url::parse(&self.login_url())
            .with_context(|| format!("AUTH_LOGIN_URL is not a valid URL: {}", self.login_url()))?;

        if self.username.is_some() != self.password.is_some() {
            anyhow::bail!("API_USERNAME and API_PASSWORD must be set together");
        }

        for (name, value) in [
            ("TOKEN_REFRESH_THRESHOLD", self.token_refresh_threshold),
            ("TOKEN_DEFAULT_TTL", self.token_default_ttl),
            ("TOKEN_UNKNOWN_EXPIRY_TTL", self.token_unknown_expiry_ttl),
            ("LOGIN_TIMEOUT", self.login_timeout),
            ("HTTP_REQUEST_TIMEOUT", self.http_request_timeout),
        ] {
            if value > MAX_DURATION_SECS {
                anyhow::bail!(
                    "{} ({}) exceeds the maximum of {} seconds",
                    name,
                    value,
                    MAX_DURATION_SECS
                );
            }
        }

        if self.token_default_ttl <= self.token_refresh_threshold {
            anyhow::bail!(
                "TOKEN_DEFAULT_TTL ({}) must be greater than TOKEN_REFRESH_THRESHOLD ({})",
                self.token_default_ttl,
                self.token_refresh_threshold
            );
        }

        if self.login_timeout == 0 {
            anyhow::bail!("LOGIN_TIMEOUT must be at least 1 second");
        }

        Ok(())
    }

    /// Absolute login endpoint
    pub fn login_url(&self) -> String {
        if self.login_url.starts_with("http://") || self.login_url.starts_with("https://") {
            self.login_url.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                self.login_url.trim_start_matches('/')
            )
        }
    }
}

/// Default token store location under the user data directory
fn default_token_store() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("transport-api-harness").join("tokens.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Read an env-only numeric setting
fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number of seconds, got {:?}", name, raw)),
        _ => Ok(default),
    }
}

/// Parse a NAME=VALUE header override
fn parse_header_pair(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {:?}", s));
    }
    Ok((name.to_string(), value.to_string()))
}
