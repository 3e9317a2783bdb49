//! Per-key token bucket used to throttle IPC clients

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Token-bucket rate limiter keyed by any hashable caller identity
#[derive(Debug)]
pub struct RateLimiter<K> {
    capacity: u32,
    refill_interval: Duration,
    buckets: HashMap<K, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    /// Allow `capacity` requests per `interval` for each key
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval: interval,
            buckets: HashMap::new(),
        }
    }

    /// Consume a token for `key`; false when the key is throttled
    pub fn check(&mut self, key: &K) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&mut self, key: &K, now: Instant) -> bool {
        let capacity = self.capacity;
        let bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed >= self.refill_interval && !self.refill_interval.is_zero() {
            let intervals = (elapsed.as_millis() / self.refill_interval.as_millis()) as u32;
            bucket.tokens = bucket
                .tokens
                .saturating_add(intervals.saturating_mul(capacity))
                .min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Forget a key (e.g. on disconnect)
    pub fn remove(&mut self, key: &K) {
        self.buckets.remove(key);
    }

    /// Number of tracked keys
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
