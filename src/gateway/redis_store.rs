use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::auth::{CredentialRecord, CredentialStore};
use super::config::RedisConfig;
use super::counter_store::{SharedCounterStore, StoreError, StorePool};

const INCREMENT_SCRIPT: &str = r#"
local value = redis.call("INCRBY", KEYS[1], ARGV[1])
if redis.call("PTTL", KEYS[1]) < 0 then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return value
"#;

// A window that already expired forgets its reservations; never resurrect it.
const DECREMENT_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return 0
end
return redis.call("DECRBY", KEYS[1], ARGV[1])
"#;

/// Redis-backed budget counters and credential lookups. Every command runs through the
/// [`StorePool`], so a slow or hung Redis degrades to local budgets instead of stalling
/// requests.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    pool: StorePool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("available_permits", &self.pool.available())
            .finish()
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto".to_string(),
            pool: StorePool::default(),
        })
    }

    pub fn from_config(config: &RedisConfig) -> Result<Self, StoreError> {
        Ok(Self::new(&config.url)?
            .with_prefix(config.prefix.clone())
            .with_pool(
                StorePool::new(
                    config.max_in_flight,
                    Duration::from_millis(config.acquire_timeout_ms),
                )
                .with_op_timeout(Duration::from_millis(config.op_timeout_ms)),
            ))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_pool(mut self, pool: StorePool) -> Self {
        self.pool = pool;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.pool
            .run(async {
                let mut conn = self.connection().await?;
                let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
                Ok::<_, StoreError>(())
            })
            .await
    }

    fn key_credentials(&self) -> String {
        format!("{}:credentials", self.prefix)
    }

    pub async fn put_credential(
        &self,
        hash: &str,
        record: &CredentialRecord,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        self.pool
            .run(async {
                let mut conn = self.connection().await?;
                let _: () = conn.hset(self.key_credentials(), hash, raw).await?;
                Ok::<_, StoreError>(())
            })
            .await
    }

    pub async fn remove_credential(&self, hash: &str) -> Result<bool, StoreError> {
        self.pool
            .run(async {
                let mut conn = self.connection().await?;
                let removed: i64 = conn.hdel(self.key_credentials(), hash).await?;
                Ok::<_, StoreError>(removed > 0)
            })
            .await
    }
}

#[async_trait]
impl SharedCounterStore for RedisStore {
    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.pool
            .run(async {
                let mut conn = self.connection().await?;
                let value: i64 = redis::Script::new(INCREMENT_SCRIPT)
                    .key(key)
                    .arg(amount)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, StoreError>(value)
            })
            .await
    }

    async fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        self.pool
            .run(async {
                let mut conn = self.connection().await?;
                let value: i64 = redis::Script::new(DECREMENT_SCRIPT)
                    .key(key)
                    .arg(amount)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, StoreError>(value)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let raw = self
            .pool
            .run(async {
                let mut conn = self.connection().await?;
                let raw: Option<String> = conn.hget(self.key_credentials(), hash).await?;
                Ok::<_, StoreError>(raw)
            })
            .await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
