//! Per-connection token buckets for outbound provider calls.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::Serialize;
use tracing::debug;

use crate::error::PosError;

type Bucket = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens available in a full bucket.
    pub capacity: u32,
    /// Time for an empty bucket to refill completely.
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub total_wait_ms: u64,
    pub active_buckets: usize,
}

pub struct RateLimiter {
    quota: Quota,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    total_requests: AtomicU64,
    throttled_requests: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, PosError> {
        let capacity = NonZeroU32::new(config.capacity)
            .ok_or_else(|| PosError::Config("rate limiter capacity must be > 0".into()))?;
        if config.refill_interval.is_zero() {
            return Err(PosError::Config(
                "rate limiter refill interval must be > 0".into(),
            ));
        }
        // One token drips back every interval/capacity; a full refill takes the whole interval.
        let period = (config.refill_interval / capacity.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| PosError::Config("invalid rate limiter period".into()))?
            .allow_burst(capacity);
        Ok(Self {
            quota,
            buckets: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            throttled_requests: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
        })
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(self.quota)))
            .clone()
    }

    /// Wait until the bucket for `key` hands out a token. Never fails, only delays.
    pub async fn acquire_token(&self, key: &str) {
        let bucket = self.bucket(key);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let Err(not_until) = bucket.check() else {
            return;
        };
        let expected = not_until.wait_time_from(DefaultClock::default().now());
        debug!(connection = key, wait_ms = expected.as_millis() as u64, "rate limited; waiting for token");
        let started = Instant::now();
        bucket.until_ready().await;
        self.throttled_requests.fetch_add(1, Ordering::Relaxed);
        self.total_wait_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    /// Drop the bucket for one connection.
    pub fn clear(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.remove(key).is_some()
    }

    /// Drop every bucket (teardown).
    pub fn clear_all(&self) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.clear();
    }

    pub fn stats(&self) -> RateLimiterStats {
        let active_buckets = self
            .buckets
            .lock()
            .map(|b| b.len())
            .unwrap_or_else(|e| e.into_inner().len());
        RateLimiterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            throttled_requests: self.throttled_requests.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_micros.load(Ordering::Relaxed) / 1000,
            active_buckets,
        }
    }
}
