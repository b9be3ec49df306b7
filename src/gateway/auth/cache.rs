use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::AuthenticatedIdentity;
use crate::gateway::{Clock, SystemClock};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    pub positive_ttl_seconds: u64,
    /// Kept short: a credential that becomes valid is picked up within this window.
    pub negative_ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl_seconds: 60,
            negative_ttl_seconds: 10,
            max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedAuth {
    Identity(Arc<AuthenticatedIdentity>),
    /// The store said no. Cached so that repeated bad credentials do not reach the store.
    Negative,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: CachedAuth,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

/// Authentication results keyed by credential hash.
pub struct AuthCache {
    config: AuthCacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for AuthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new(AuthCacheConfig::default())
    }
}

impl AuthCache {
    pub fn new(config: AuthCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AuthCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key_hash: &str) -> Option<CachedAuth> {
        let now = self.clock.now_epoch_millis();
        let mut state = self.lock();
        let expires_at = state.entries.get(key_hash)?.expires_at_ms;
        if now >= expires_at {
            state.entries.remove(key_hash);
            state.order.retain(|candidate| candidate != key_hash);
            return None;
        }
        state.entries.get(key_hash).map(|entry| entry.value.clone())
    }

    /// Positive entries expire at the configured TTL or the credential's own expiry, whichever
    /// comes first.
    pub fn insert(&self, key_hash: &str, identity: Option<Arc<AuthenticatedIdentity>>) {
        let credential_expiry = identity.as_ref().and_then(|identity| identity.expires_at_ms);
        let (value, ttl_seconds) = match identity {
            Some(identity) => (
                CachedAuth::Identity(identity),
                self.config.positive_ttl_seconds,
            ),
            None => (CachedAuth::Negative, self.config.negative_ttl_seconds),
        };
        if ttl_seconds == 0 || self.config.max_entries == 0 {
            return;
        }

        let now = self.clock.now_epoch_millis();
        let mut expires_at_ms = now.saturating_add(ttl_seconds.saturating_mul(1000));
        if let Some(credential_expiry) = credential_expiry {
            expires_at_ms = expires_at_ms.min(credential_expiry);
        }
        if expires_at_ms <= now {
            return;
        }
        let mut state = self.lock();

        if state.entries.contains_key(key_hash) {
            state.order.retain(|candidate| candidate != key_hash);
        } else {
            while state.entries.len() >= self.config.max_entries {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
            }
        }

        state.entries.insert(
            key_hash.to_string(),
            CacheEntry {
                value,
                expires_at_ms,
            },
        );
        state.order.push_back(key_hash.to_string());
    }

    /// Forgets one credential, e.g. after it was revoked.
    pub fn invalidate(&self, key_hash: &str) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(key_hash).is_some();
        if removed {
            state.order.retain(|candidate| candidate != key_hash);
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::auth::AuthMethod;

    fn identity(user: &str) -> Arc<AuthenticatedIdentity> {
        Arc::new(AuthenticatedIdentity {
            user_id: user.to_string(),
            tenant_id: "t".to_string(),
            auth_method: AuthMethod::ApiKey,
            scopes: Vec::new(),
            application_id: None,
            expires_at_ms: None,
        })
    }

    #[test]
    fn negative_entries_expire_sooner() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = AuthCache::with_clock(
            AuthCacheConfig {
                positive_ttl_seconds: 60,
                negative_ttl_seconds: 5,
                max_entries: 16,
            },
            clock.clone(),
        );
        cache.insert("good", Some(identity("u")));
        cache.insert("bad", None);
        assert_eq!(cache.get("bad"), Some(CachedAuth::Negative));

        clock.advance_millis(5_000);
        assert_eq!(cache.get("bad"), None);
        assert!(matches!(cache.get("good"), Some(CachedAuth::Identity(_))));

        clock.advance_millis(55_000);
        assert_eq!(cache.get("good"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn identities_never_outlive_their_credential() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = AuthCache::with_clock(AuthCacheConfig::default(), clock.clone());
        let mut short_lived = (*identity("u")).clone();
        short_lived.expires_at_ms = Some(5_000);
        cache.insert("session", Some(Arc::new(short_lived)));
        assert!(matches!(cache.get("session"), Some(CachedAuth::Identity(_))));

        clock.advance_millis(5_000);
        assert_eq!(cache.get("session"), None);

        let mut expired = (*identity("u")).clone();
        expired.expires_at_ms = Some(1_000);
        cache.insert("stale", Some(Arc::new(expired)));
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = AuthCache::new(AuthCacheConfig {
            max_entries: 2,
            ..AuthCacheConfig::default()
        });
        cache.insert("a", None);
        cache.insert("b", None);
        cache.insert("a", Some(identity("u")));
        cache.insert("c", None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = AuthCache::default();
        cache.insert("a", Some(identity("u")));
        cache.insert("b", None);
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert!(cache.get("a").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }
}
