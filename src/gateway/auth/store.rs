use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{CredentialRecord, CredentialStore};
use crate::gateway::counter_store::{StoreError, StorePool};

/// Credentials held in process, keyed by hash. Backs configs that list keys inline and tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn from_records(records: HashMap<String, CredentialRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn insert(&self, hash: impl Into<String>, record: CredentialRecord) {
        match self.records.write() {
            Ok(mut records) => {
                records.insert(hash.into(), record);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(hash.into(), record);
            }
        }
    }

    pub fn remove(&self, hash: &str) -> Option<CredentialRecord> {
        match self.records.write() {
            Ok(mut records) => records.remove(hash),
            Err(poisoned) => poisoned.into_inner().remove(hash),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .map(|records| records.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let record = match self.records.read() {
            Ok(records) => records.get(hash).cloned(),
            Err(poisoned) => poisoned.into_inner().get(hash).cloned(),
        };
        Ok(record)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Wraps a remote store so each lookup holds one pool permit for the duration of the query.
pub struct PooledCredentialStore<S> {
    inner: S,
    pool: StorePool,
}

impl<S: CredentialStore> PooledCredentialStore<S> {
    pub fn new(inner: S, pool: StorePool) -> Self {
        Self { inner, pool }
    }

    pub fn into_shared(self) -> Arc<dyn CredentialStore>
    where
        S: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<S: CredentialStore> CredentialStore for PooledCredentialStore<S> {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let _permit = self.pool.acquire().await?;
        self.inner.lookup_by_hash(hash).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SlowStore;

    #[async_trait]
    impl CredentialStore for SlowStore {
        async fn lookup_by_hash(
            &self,
            _hash: &str,
        ) -> Result<Option<CredentialRecord>, StoreError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(None)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_records() {
        let store = MemoryCredentialStore::default();
        store.insert("h", CredentialRecord::new("u", "t"));
        assert_eq!(
            store.lookup_by_hash("h").await.unwrap(),
            Some(CredentialRecord::new("u", "t"))
        );
        assert_eq!(store.lookup_by_hash("missing").await.unwrap(), None);
        assert!(store.remove("h").is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn pooled_store_reports_exhaustion() {
        let store = Arc::new(PooledCredentialStore::new(
            SlowStore,
            StorePool::new(1, Duration::from_millis(10)),
        ));
        let busy = {
            let store = store.clone();
            tokio::spawn(async move { store.lookup_by_hash("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = store.lookup_by_hash("b").await.expect_err("pool exhausted");
        assert!(err.is_pool_exhausted());
        assert!(busy.await.unwrap().is_ok());
    }
}
