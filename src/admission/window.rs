//! Fixed one-second windows counted in a shared store.
//!
//! Each request increments `rl:<client>:<unix-second>`. The first increment
//! in a window sets a short expiry so old windows disappear on their own. A
//! request is admitted while the window count stays within `rps + burst`.
//!
//! A client can get up to twice that budget across a window boundary. If the
//! store fails the request is admitted.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::AdmissionControl;
use crate::{Error, Result};

/// Window counters live slightly longer than the window itself.
const WINDOW_EXPIRY: Duration = Duration::from_secs(2);

/// Atomic counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Expire `key` after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Redis-backed counters.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect and verify with `PING`, both bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Internal(format!("redis connect timed out after {timeout:?}")))??;
        let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| Error::Internal(format!("redis PING timed out after {timeout:?}")))??;
        debug!("Redis counter store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _: () = conn.expire(key, seconds).await?;
        Ok(())
    }
}

/// Fixed-window limiter over any [`CounterStore`].
pub struct FixedWindowLimiter<S> {
    store: S,
    limit: i64,
}

impl<S: CounterStore> FixedWindowLimiter<S> {
    /// Admit up to `rps + burst` requests per client per second.
    pub fn new(store: S, requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            store,
            limit: i64::from(requests_per_second) + i64::from(burst_size),
        }
    }

    /// Admission decision for `key` in the window starting at `window` (unix seconds).
    pub async fn allow_in_window(&self, key: &str, window: i64) -> bool {
        let counter = format!("rl:{key}:{window}");

        let count = match self.store.incr(&counter).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, client = %key, "Counter store unavailable, admitting");
                return true;
            }
        };

        if count == 1 {
            if let Err(e) = self.store.expire(&counter, WINDOW_EXPIRY).await {
                warn!(error = %e, counter = %counter, "Failed to set window expiry");
            }
        }

        count <= self.limit
    }
}

#[async_trait]
impl<S: CounterStore> AdmissionControl for FixedWindowLimiter<S> {
    async fn allow(&self, key: &str) -> bool {
        self.allow_in_window(key, chrono::Utc::now().timestamp()).await
    }

    fn name(&self) -> &'static str {
        "fixed-window"
    }
}
