//! Cross-process counters used to share budgets between gateway instances.
//!
//! The store is optional. Callers treat every error as "use the local bucket" and count the
//! fallback; nothing in here may turn a store outage into a request failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{Clock, SystemClock};

/// How long one store call may take before the caller gives up on it.
pub const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store connection pool exhausted")]
    PoolExhausted,
    #[error("invalid store record: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}

#[cfg(feature = "gateway-store-redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(format!("redis error: {err}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Runs a store call with an upper bound. A store that hangs is reported as unavailable so
/// callers take their usual fallback path.
pub async fn with_deadline<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "store call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Adds `amount` to `key` and returns the new value. The key expires `ttl` after it was
    /// first created.
    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError>;

    async fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError>;

    fn name(&self) -> &'static str;
}

/// Bounds concurrent store operations. A caller that cannot get a permit within
/// `acquire_timeout` gets [`StoreError::PoolExhausted`] instead of waiting in an unbounded
/// queue; [`run`](Self::run) also caps the operation itself at `op_timeout`.
#[derive(Clone, Debug)]
pub struct StorePool {
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    op_timeout: Duration,
}

impl Default for StorePool {
    fn default() -> Self {
        Self::new(64, Duration::from_millis(50))
    }
}

impl StorePool {
    pub fn new(max_in_flight: usize, acquire_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            acquire_timeout,
            op_timeout: DEFAULT_STORE_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Holds a permit for the duration of `op`, which must finish within `op_timeout`.
    pub async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let _permit = self.acquire().await?;
        with_deadline(self.op_timeout, op).await
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, StoreError> {
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StoreError::Unavailable("store pool closed".to_string())),
            Err(_) => Err(StoreError::PoolExhausted),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    value: i64,
    expires_at_ms: u64,
}

/// Process-local [`SharedCounterStore`]. Useful for single-instance deployments and tests; it
/// shares nothing across processes.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryCounterStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_epoch_millis();
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .get(key)
            .filter(|counter| counter.expires_at_ms > now)
            .map(|counter| counter.value)
    }
}

#[async_trait]
impl SharedCounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now_epoch_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.retain(|_, counter| counter.expires_at_ms > now);
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at_ms: now.saturating_add(ttl_ms),
        });
        counter.value = counter.value.saturating_add(amount);
        Ok(counter.value)
    }

    async fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_epoch_millis();
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match counters.get_mut(key) {
            Some(counter) if counter.expires_at_ms > now => {
                counter.value = counter.value.saturating_sub(amount);
                Ok(counter.value)
            }
            // An expired window already forgot the reservation.
            _ => Ok(0),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    #[tokio::test]
    async fn memory_counters_expire_with_their_window() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCounterStore::with_clock(clock.clone());

        let ttl = Duration::from_secs(60);
        assert_eq!(store.increment("k", 5, ttl).await.unwrap(), 5);
        assert_eq!(store.increment("k", 3, ttl).await.unwrap(), 8);
        assert_eq!(store.decrement("k", 2).await.unwrap(), 6);

        clock.advance_millis(60_000);
        assert_eq!(store.get("k"), None);
        assert_eq!(store.decrement("k", 2).await.unwrap(), 0);
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pool_reports_exhaustion_instead_of_queueing() {
        let pool = StorePool::new(1, Duration::from_millis(10));
        let held = pool.acquire().await.expect("first permit");
        let err = pool.acquire().await.expect_err("pool should be exhausted");
        assert!(err.is_pool_exhausted());
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn hung_operations_time_out_as_unavailable() {
        let pool = StorePool::new(1, Duration::from_millis(10))
            .with_op_timeout(Duration::from_millis(20));
        let err = pool
            .run(std::future::pending::<Result<i64, StoreError>>())
            .await
            .expect_err("hung call should time out");
        assert!(matches!(err, StoreError::Unavailable(_)));
        // The permit was returned when the call was abandoned.
        assert_eq!(pool.available(), 1);
    }
}
