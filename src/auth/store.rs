// Persisted token store backed by a SQLite key-value table

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::types::PersistedToken;

/// Key under which the access token record is stored
pub const DEFAULT_TOKEN_KEY: &str = "transport-api:access-token";

/// Read/write access to the token persisted between runs
pub trait TokenStore: Send + Sync {
    /// Load the persisted token, `None` if nothing was ever written
    fn load(&self) -> Result<Option<PersistedToken>>;

    /// Replace the persisted token
    fn save(&self, token: &PersistedToken) -> Result<()>;
}

/// Token store in a local SQLite file (`auth_kv` table, JSON values)
#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    path: PathBuf,
    key: String,
}

impl SqliteTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: DEFAULT_TOKEN_KEY.to_string(),
        }
    }

    /// Use a different key, e.g. one per target environment
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create token store directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open SQLite database: {}", self.path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(conn)
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Result<Option<PersistedToken>> {
        // No file means no previous run wrote anything
        if !self.path.exists() {
            return Ok(None);
        }

        let conn = self.open()?;
        let token_json: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [self.key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load token data from SQLite")?;

        let Some(token_json) = token_json else {
            return Ok(None);
        };

        let token: PersistedToken = serde_json::from_str(&token_json)
            .context("Failed to parse token data from SQLite")?;

        Ok(Some(token))
    }

    fn save(&self, token: &PersistedToken) -> Result<()> {
        let conn = self.open()?;
        let token_json =
            serde_json::to_string(token).context("Failed to serialize token data")?;

        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [self.key.as_str(), token_json.as_str()],
        )
        .context("Failed to write token data to SQLite")?;

        tracing::debug!("Persisted token to {}", self.path.display());
        Ok(())
    }
}
