//! Continuous-refill token buckets keyed by arbitrary strings.
//!
//! Refill is lazy: a bucket's balance is recomputed from elapsed wall-clock time whenever the
//! key is touched, so idle keys cost nothing. Every map mutation happens under one short-lived
//! mutex that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Clock, SystemClock};

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

#[derive(Debug, Default)]
struct BucketMap {
    buckets: HashMap<String, Bucket>,
    last_sweep_ms: u64,
}

pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketMap>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("rate_per_sec", &self.rate_per_sec)
            .field("keys", &self.len())
            .finish()
    }
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self::with_clock(capacity, rate_per_sec, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: f64, rate_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: sanitize(capacity),
            rate_per_sec: sanitize(rate_per_sec),
            clock,
            state: Mutex::new(BucketMap::default()),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// Takes `cost` tokens if the bucket holds at least that many. A denied consume leaves the
    /// bucket untouched.
    pub fn consume(&self, key: &str, cost: f64) -> bool {
        let cost = sanitize(cost);
        let now = self.clock.now_epoch_millis();
        let mut state = self.lock();
        self.maybe_sweep(&mut state, now);
        let bucket = self.refilled(&mut state, key, now);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self, key: &str) -> f64 {
        let now = self.clock.now_epoch_millis();
        let mut state = self.lock();
        self.refilled(&mut state, key, now).tokens
    }

    /// Returns over-reserved tokens to the bucket, clamped at capacity.
    pub fn release(&self, key: &str, amount: f64) {
        let amount = sanitize(amount);
        if amount == 0.0 {
            return;
        }
        let now = self.clock.now_epoch_millis();
        let mut state = self.lock();
        let capacity = self.capacity;
        let bucket = self.refilled(&mut state, key, now);
        bucket.tokens = (bucket.tokens + amount).min(capacity);
    }

    /// Charges `amount` unconditionally. The balance may go negative, floored at `-capacity`,
    /// so the overrun is paid back by later requests instead of being forgotten.
    pub fn debit(&self, key: &str, amount: f64) {
        let amount = sanitize(amount);
        if amount == 0.0 {
            return;
        }
        let now = self.clock.now_epoch_millis();
        let mut state = self.lock();
        let floor = -self.capacity;
        let bucket = self.refilled(&mut state, key, now);
        bucket.tokens = (bucket.tokens - amount).max(floor);
    }

    pub fn clear(&self) {
        self.lock().buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BucketMap> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refilled<'a>(&self, state: &'a mut BucketMap, key: &str, now: u64) -> &'a mut Bucket {
        let capacity = self.capacity;
        let bucket = state.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill_ms: now,
        });
        // A clock that steps backwards refills nothing; last writer wins on the timestamp.
        let elapsed_ms = now.saturating_sub(bucket.last_refill_ms);
        if elapsed_ms > 0 {
            let elapsed = elapsed_ms as f64 / 1000.0;
            bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(capacity);
        }
        bucket.last_refill_ms = now;
        bucket
    }

    /// Drops buckets that have been idle long enough to be full again. Runs at most once per
    /// two full-refill periods.
    fn maybe_sweep(&self, state: &mut BucketMap, now: u64) {
        let Some(full_refill_ms) = self.full_refill_ms() else {
            return;
        };
        if now.saturating_sub(state.last_sweep_ms) < full_refill_ms {
            return;
        }
        state.last_sweep_ms = now;
        let capacity = self.capacity;
        let rate = self.rate_per_sec;
        state.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_sub(bucket.last_refill_ms) as f64 / 1000.0;
            bucket.tokens + elapsed * rate < capacity
        });
    }

    fn full_refill_ms(&self) -> Option<u64> {
        if self.rate_per_sec <= 0.0 {
            return None;
        }
        let ms = (2.0 * self.capacity / self.rate_per_sec * 1000.0).ceil();
        if !ms.is_finite() || ms > u64::MAX as f64 {
            return None;
        }
        Some((ms as u64).max(1))
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    fn bucket(capacity: f64, rate: f64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let bucket = TokenBucket::with_clock(capacity, rate, clock.clone());
        (bucket, clock)
    }

    #[test]
    fn unknown_keys_start_full() {
        let (bucket, _clock) = bucket(10.0, 1.0);
        assert_eq!(bucket.remaining("fresh"), 10.0);
        assert!(bucket.consume("fresh", 10.0));
        assert_eq!(bucket.remaining("fresh"), 0.0);
    }

    #[test]
    fn denied_consume_leaves_balance_unchanged() {
        let (bucket, _clock) = bucket(5.0, 0.0);
        assert!(bucket.consume("k", 3.0));
        let before = bucket.remaining("k");
        assert!(!bucket.consume("k", 3.0));
        assert_eq!(bucket.remaining("k"), before);
        assert!(bucket.remaining("k") >= 0.0);
    }

    #[test]
    fn refill_is_lazy_and_clamped() {
        let (bucket, clock) = bucket(4.0, 2.0);
        assert!(bucket.consume("k", 4.0));
        clock.advance_millis(500);
        assert_eq!(bucket.remaining("k"), 1.0);
        let mut last = bucket.remaining("k");
        for _ in 0..10 {
            clock.advance_millis(250);
            let now = bucket.remaining("k");
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 4.0);
    }

    #[test]
    fn release_never_exceeds_capacity() {
        let (bucket, _clock) = bucket(10.0, 0.0);
        assert!(bucket.consume("k", 2.0));
        bucket.release("k", 50.0);
        assert_eq!(bucket.remaining("k"), 10.0);
    }

    #[test]
    fn debit_is_floored_at_negative_capacity() {
        let (bucket, clock) = bucket(10.0, 10.0);
        bucket.debit("k", 15.0);
        assert_eq!(bucket.remaining("k"), -5.0);
        bucket.debit("k", 100.0);
        assert_eq!(bucket.remaining("k"), -10.0);
        assert!(!bucket.consume("k", 1.0));
        clock.advance_millis(1_100);
        assert!(bucket.consume("k", 1.0));
    }

    #[test]
    fn clock_rollback_does_not_refill() {
        let (bucket, clock) = bucket(2.0, 1.0);
        assert!(bucket.consume("k", 2.0));
        clock.set_millis(0);
        assert_eq!(bucket.remaining("k"), 0.0);
    }

    #[test]
    fn idle_full_buckets_are_swept() {
        let (bucket, clock) = bucket(1.0, 1.0);
        assert!(bucket.consume("a", 1.0));
        assert!(bucket.consume("b", 0.5));
        assert_eq!(bucket.len(), 2);
        clock.advance_millis(10_000);
        assert!(bucket.consume("c", 1.0));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn clear_forgets_history() {
        let (bucket, _clock) = bucket(1.0, 0.0);
        assert!(bucket.consume("k", 1.0));
        bucket.clear();
        assert!(bucket.is_empty());
        assert!(bucket.consume("k", 1.0));
    }
}
