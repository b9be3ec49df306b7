use std::sync::Arc;

use super::{
    AuthCache, AuthMethod, AuthenticatedIdentity, Authenticator, CachedAuth, CredentialStore,
    hash_credential,
};
use crate::gateway::metrics::MetricsHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Arc<AuthenticatedIdentity>),
    /// No authenticator recognised the credential's shape. The store was not consulted.
    UnknownShape,
    Invalid(AuthMethod),
    /// The store could not answer. Treated as unauthenticated and not cached.
    StoreUnavailable(AuthMethod),
}

impl AuthOutcome {
    pub fn identity(&self) -> Option<&Arc<AuthenticatedIdentity>> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn into_identity(self) -> Option<Arc<AuthenticatedIdentity>> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<AuthMethod> {
        match self {
            Self::Authenticated(identity) => Some(identity.auth_method),
            Self::UnknownShape => None,
            Self::Invalid(method) | Self::StoreUnavailable(method) => Some(*method),
        }
    }
}

pub struct AuthService {
    authenticators: Vec<Arc<dyn Authenticator>>,
    store: Arc<dyn CredentialStore>,
    cache: AuthCache,
    metrics: MetricsHandle,
}

impl AuthService {
    /// Authenticators are tried in order; the first whose prefix matches owns the credential.
    pub fn new(
        authenticators: Vec<Arc<dyn Authenticator>>,
        store: Arc<dyn CredentialStore>,
        cache: AuthCache,
    ) -> Self {
        Self {
            authenticators,
            store,
            cache,
            metrics: MetricsHandle::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cache(&self) -> &AuthCache {
        &self.cache
    }

    pub async fn authenticate(&self, token: &str) -> Option<Arc<AuthenticatedIdentity>> {
        self.authenticate_detailed(token).await.into_identity()
    }

    pub async fn authenticate_detailed(&self, token: &str) -> AuthOutcome {
        let Some(authenticator) = self
            .authenticators
            .iter()
            .find(|authenticator| authenticator.matches(token))
        else {
            self.metrics
                .record(|metrics| metrics.record_auth_invalid("unknown"));
            return AuthOutcome::UnknownShape;
        };
        let method = authenticator.method();
        let token_hash = hash_credential(token);

        if let Some(cached) = self.cache.get(&token_hash) {
            self.metrics.record(|metrics| metrics.record_auth_cache_hit());
            return match cached {
                CachedAuth::Identity(identity) => AuthOutcome::Authenticated(identity),
                CachedAuth::Negative => {
                    self.metrics
                        .record(|metrics| metrics.record_auth_invalid(method.as_str()));
                    AuthOutcome::Invalid(method)
                }
            };
        }
        self.metrics.record(|metrics| metrics.record_auth_cache_miss());

        match authenticator
            .authenticate(&token_hash, self.store.as_ref())
            .await
        {
            Ok(Some(identity)) => {
                let identity = Arc::new(identity);
                self.cache.insert(&token_hash, Some(identity.clone()));
                AuthOutcome::Authenticated(identity)
            }
            Ok(None) => {
                self.cache.insert(&token_hash, None);
                self.metrics
                    .record(|metrics| metrics.record_auth_invalid(method.as_str()));
                AuthOutcome::Invalid(method)
            }
            Err(err) => {
                tracing::warn!(
                    auth_method = method.as_str(),
                    store = self.store.name(),
                    error = %err,
                    "credential store lookup failed"
                );
                let pool_exhausted = err.is_pool_exhausted();
                self.metrics.record(|metrics| {
                    metrics.record_auth_store_unavailable();
                    if pool_exhausted {
                        metrics.record_store_pool_exhausted("credentials");
                    }
                });
                AuthOutcome::StoreUnavailable(method)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::gateway::auth::{
        CredentialRecord, KeyAuthenticator, MemoryCredentialStore, SessionTokenAuthenticator,
    };
    use crate::gateway::ManualClock;
    use crate::gateway::auth::AuthCacheConfig;
    use crate::gateway::counter_store::StoreError;

    struct CountingStore {
        inner: MemoryCredentialStore,
        lookups: AtomicUsize,
        fail: bool,
    }

    impl CountingStore {
        fn new(fail: bool) -> Self {
            let inner = MemoryCredentialStore::default();
            inner.insert(
                hash_credential("sk-ditto-good"),
                CredentialRecord::new("user-1", "team-1"),
            );
            Self {
                inner,
                lookups: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn lookup_by_hash(
            &self,
            hash: &str,
        ) -> Result<Option<CredentialRecord>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.lookup_by_hash(hash).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn service(store: Arc<CountingStore>) -> (AuthService, MetricsHandle) {
        let metrics = MetricsHandle::default();
        let service = AuthService::new(
            vec![
                Arc::new(KeyAuthenticator::default()),
                Arc::new(SessionTokenAuthenticator::default()),
            ],
            store,
            AuthCache::default(),
        )
        .with_metrics(metrics.clone());
        (service, metrics)
    }

    #[tokio::test]
    async fn unknown_prefix_never_touches_the_store() {
        let store = Arc::new(CountingStore::new(false));
        let (service, metrics) = service(store.clone());
        assert_eq!(
            service.authenticate_detailed("garbage-token").await,
            AuthOutcome::UnknownShape
        );
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot().auth_invalid_total, 1);
    }

    #[tokio::test]
    async fn invalid_credentials_are_cached_negatively() {
        let store = Arc::new(CountingStore::new(false));
        let (service, metrics) = service(store.clone());

        assert!(service.authenticate("sk-ditto-nope").await.is_none());
        assert!(service.authenticate("sk-ditto-nope").await.is_none());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.auth_cache_misses_total, 1);
        assert_eq!(snapshot.auth_cache_hits_total, 1);
        assert_eq!(snapshot.auth_invalid_total, 2);
    }

    #[tokio::test]
    async fn valid_credentials_are_cached() {
        let store = Arc::new(CountingStore::new(false));
        let (service, _metrics) = service(store.clone());

        let first = service.authenticate("sk-ditto-good").await.expect("identity");
        let second = service.authenticate("sk-ditto-good").await.expect("identity");
        assert_eq!(first, second);
        assert_eq!(first.auth_method, AuthMethod::ApiKey);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_session_token_stops_working_at_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCredentialStore::default());
        let mut record = CredentialRecord::new("user-1", "team-1");
        record.scopes = vec!["gateway:invoke".to_string()];
        record.expires_at_ms = Some(5_000);
        store.insert(hash_credential("st-ditto-short"), record);

        let service = AuthService::new(
            vec![Arc::new(
                SessionTokenAuthenticator::default().with_clock(clock.clone()),
            )],
            store,
            AuthCache::with_clock(AuthCacheConfig::default(), clock.clone()),
        );

        assert!(service.authenticate("st-ditto-short").await.is_some());
        clock.set_millis(30_000);
        assert_eq!(
            service.authenticate_detailed("st-ditto-short").await,
            AuthOutcome::Invalid(AuthMethod::SessionToken)
        );
    }

    #[tokio::test]
    async fn store_errors_are_not_cached() {
        let store = Arc::new(CountingStore::new(true));
        let (service, metrics) = service(store.clone());

        assert_eq!(
            service.authenticate_detailed("sk-ditto-good").await,
            AuthOutcome::StoreUnavailable(AuthMethod::ApiKey)
        );
        assert!(service.authenticate("sk-ditto-good").await.is_none());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
        assert!(service.cache().is_empty());
        assert_eq!(metrics.snapshot().auth_store_unavailable_total, 2);
    }
}
