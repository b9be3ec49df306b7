use std::sync::Arc;

use async_trait::async_trait;

use super::{
    AuthMethod, AuthenticatedIdentity, Authenticator, CredentialStore, DEFAULT_REQUIRED_SCOPE,
    DEFAULT_SESSION_TOKEN_PREFIX,
};
use crate::gateway::counter_store::StoreError;
use crate::gateway::{Clock, SystemClock};

/// Opaque bearer tokens issued by an OAuth-style flow. Unlike API keys they must carry the
/// required scope explicitly, and they normally expire.
pub struct SessionTokenAuthenticator {
    prefix: String,
    required_scope: String,
    clock: Arc<dyn Clock>,
}

impl Default for SessionTokenAuthenticator {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TOKEN_PREFIX, DEFAULT_REQUIRED_SCOPE)
    }
}

impl SessionTokenAuthenticator {
    pub fn new(prefix: impl Into<String>, required_scope: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            required_scope: required_scope.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Authenticator for SessionTokenAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::SessionToken
    }

    fn matches(&self, token: &str) -> bool {
        token.len() > self.prefix.len() && token.starts_with(&self.prefix)
    }

    async fn authenticate(
        &self,
        token_hash: &str,
        store: &dyn CredentialStore,
    ) -> Result<Option<AuthenticatedIdentity>, StoreError> {
        let Some(record) = store.lookup_by_hash(token_hash).await? else {
            return Ok(None);
        };
        if record.disabled
            || record.is_expired(self.clock.now_epoch_millis())
            || !record.has_scope(&self.required_scope)
        {
            return Ok(None);
        }
        Ok(Some(record.into_identity(AuthMethod::SessionToken)))
    }
}
