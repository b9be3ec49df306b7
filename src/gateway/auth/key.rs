use std::sync::Arc;

use async_trait::async_trait;

use super::{
    AuthMethod, AuthenticatedIdentity, Authenticator, CredentialStore, DEFAULT_API_KEY_PREFIX,
};
use crate::gateway::counter_store::StoreError;
use crate::gateway::{Clock, SystemClock};

/// Static API keys. Scopes are optional on keys: a key without scopes is accepted, a key that
/// lists scopes must list the required one (when one is configured).
pub struct KeyAuthenticator {
    prefix: String,
    required_scope: Option<String>,
    clock: Arc<dyn Clock>,
}

impl Default for KeyAuthenticator {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_PREFIX)
    }
}

impl KeyAuthenticator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            required_scope: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scope = Some(scope.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl Authenticator for KeyAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::ApiKey
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
        if record.disabled || record.is_expired(self.clock.now_epoch_millis()) {
            return Ok(None);
        }
        if let Some(scope) = self.required_scope.as_deref() {
            if !record.scopes.is_empty() && !record.has_scope(scope) {
                return Ok(None);
            }
        }
        Ok(Some(record.into_identity(AuthMethod::ApiKey)))
    }
}
