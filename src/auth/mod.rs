// Authentication module
// Manages credential lifecycle: source chain, caching, refresh and headers

mod login;
mod manager;
mod store;
mod types;

pub use login::{HttpLoginExchange, LoginExchange};
pub use manager::{CredentialManager, CredentialManagerBuilder, HeaderIdentity, Headers, RefreshPolicy};
pub use store::{SqliteTokenStore, TokenStore, DEFAULT_TOKEN_KEY};
pub use types::{Credential, CredentialSource, LoginCredentials, LoginGrant, PersistedToken};
