//! Per-client admission control.
//!
//! Two strategies sit behind [`AdmissionControl`]:
//!
//! - [`MemoryLimiter`]: one token bucket per client key, local to this process.
//! - [`FixedWindowLimiter`]: one-second counters in a shared store (Redis),
//!   so several gateway instances enforce one budget. Store errors admit the
//!   request.
//!
//! [`from_config`] picks the strategy. An unreachable shared store at
//! startup degrades to the in-memory strategy with a warning.

pub mod memory;
pub mod window;

pub use memory::MemoryLimiter;
pub use window::{CounterStore, FixedWindowLimiter, RedisCounterStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::RateLimitConfig;

/// Decides whether a client may open a session right now.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Consume one admission for `key` if available.
    async fn allow(&self, key: &str) -> bool;

    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    /// Drop per-client state idle for longer than `idle`. Returns how many
    /// entries were removed. Strategies without local state return 0.
    fn evict_idle(&self, _idle: Duration) -> usize {
        0
    }
}

/// Build the configured strategy.
pub async fn from_config(config: &RateLimitConfig) -> Arc<dyn AdmissionControl> {
    let rps = config.requests_per_second;
    let burst = config.burst_size;

    if config.redis.enabled {
        match RedisCounterStore::connect(&config.redis.url, config.redis.connect_timeout).await {
            Ok(store) => {
                info!(rps, burst, "Shared rate limiter enabled");
                return Arc::new(FixedWindowLimiter::new(store, rps, burst));
            }
            Err(e) => {
                warn!(error = %e, "Shared rate limiter unavailable, falling back to in-memory");
            }
        }
    }

    info!(rps, burst, "In-memory rate limiter enabled");
    Arc::new(MemoryLimiter::new(rps, burst))
}
