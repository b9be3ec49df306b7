//! Credential authentication: prefix-dispatched authenticators over a hash-keyed credential
//! store, fronted by a positive/negative result cache.

mod cache;
mod key;
mod service;
mod session;
mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use super::counter_store::StoreError;

pub use cache::{AuthCache, AuthCacheConfig, CachedAuth};
pub use key::KeyAuthenticator;
pub use service::{AuthOutcome, AuthService};
pub use session::SessionTokenAuthenticator;
pub use store::{MemoryCredentialStore, PooledCredentialStore};

pub const DEFAULT_API_KEY_PREFIX: &str = "sk-ditto-";
pub const DEFAULT_SESSION_TOKEN_PREFIX: &str = "st-ditto-";
pub const DEFAULT_REQUIRED_SCOPE: &str = "gateway:invoke";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    SessionToken,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::SessionToken => "session_token",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub user_id: String,
    pub tenant_id: String,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub application_id: Option<String>,
    /// When the underlying credential stops being valid. Cached identities never outlive it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

/// What the credential store holds for one hashed credential. The raw secret is never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub owner_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl CredentialRecord {
    pub fn new(owner_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            tenant_id: tenant_id.into(),
            scopes: Vec::new(),
            expires_at_ms: None,
            application_id: None,
            disabled: false,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|expires_at| expires_at <= now_ms)
    }

    fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|candidate| candidate == scope)
    }

    fn into_identity(self, auth_method: AuthMethod) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            user_id: self.owner_id,
            tenant_id: self.tenant_id,
            auth_method,
            scopes: self.scopes,
            application_id: self.application_id,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<CredentialRecord>, StoreError>;

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> AuthMethod;

    /// Cheap shape check on the raw credential. Never touches the store.
    fn matches(&self, token: &str) -> bool;

    /// `Ok(None)` means the credential is unknown or not acceptable; `Err` means the store could
    /// not answer.
    async fn authenticate(
        &self,
        token_hash: &str,
        store: &dyn CredentialStore,
    ) -> Result<Option<AuthenticatedIdentity>, StoreError>;
}

/// Lowercase hex SHA-256 of a raw credential, the only form in which credentials are stored,
/// cached or looked up.
pub fn hash_credential(raw: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(raw.as_bytes());
    hex_lower(&hasher.finalize())
}

/// Picks the credential out of an `Authorization: Bearer …` value, falling back to an
/// `x-api-key` value.
pub fn extract_credential<'a>(
    authorization: Option<&'a str>,
    x_api_key: Option<&'a str>,
) -> Option<&'a str> {
    let bearer = authorization.and_then(|value| {
        let value = value.trim();
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    });
    bearer.or_else(|| {
        x_api_key
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_lowercase_sha256_hex() {
        assert_eq!(
            hash_credential("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_credential("sk-ditto-a"), hash_credential("sk-ditto-b"));
    }

    #[test]
    fn extracts_bearer_then_api_key_header() {
        assert_eq!(
            extract_credential(Some("Bearer sk-ditto-1"), Some("sk-ditto-2")),
            Some("sk-ditto-1")
        );
        assert_eq!(
            extract_credential(Some("bearer   st-ditto-1 "), None),
            Some("st-ditto-1")
        );
        assert_eq!(
            extract_credential(Some("Basic dXNlcjpwYXNz"), Some("sk-ditto-2")),
            Some("sk-ditto-2")
        );
        assert_eq!(extract_credential(Some("Bearer "), Some("  ")), None);
        assert_eq!(extract_credential(None, None), None);
    }
}
