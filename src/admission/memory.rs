//! In-process token buckets, one per client key.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

use super::AdmissionControl;

type ClientRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Bucket {
    limiter: ClientRateLimiter,
    /// Milliseconds since the owning limiter's epoch.
    last_seen: AtomicU64,
}

/// Token bucket per client: refills at `rps` per second, holds up to `burst`.
pub struct MemoryLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    quota: Quota,
    epoch: Instant,
}

impl MemoryLimiter {
    /// Create a limiter. Zero values are raised to one.
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst_size).unwrap_or(NonZeroU32::MIN));
        Self {
            buckets: DashMap::new(),
            quota,
            epoch: Instant::now(),
        }
    }

    /// Number of client keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Bucket {
                limiter: RateLimiter::direct(self.quota),
                last_seen: AtomicU64::new(0),
            })
        });
        Arc::clone(bucket.value())
    }
}

#[async_trait]
impl AdmissionControl for MemoryLimiter {
    async fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        bucket.last_seen.store(self.now_millis(), Ordering::Relaxed);
        bucket.limiter.check().is_ok()
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.now_millis();
        let idle = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_seen.load(Ordering::Relaxed)) < idle);
        before.saturating_sub(self.buckets.len())
    }
}
