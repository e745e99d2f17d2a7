//! Key-set cache: fetches the verification JWKS and keeps it for a TTL.
//!
//! # Refresh coalescing
//!
//! At most one fetch is in flight at a time. A caller that finds the cache
//! stale while another caller is fetching does not start a second fetch: it
//! waits for the completion broadcast (bounded by `refresh_wait`) and then
//! re-evaluates from the top. If the in-flight fetch failed, the next caller
//! to re-evaluate claims the slot and fetches again.
//!
//! The lock guarding the cached set and the in-flight flag is never held
//! across I/O. Readers see either the old set or the new one, never a mix:
//! the set is swapped as a whole `Arc`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::AuthError;

/// Where key sets come from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, AuthError>;
}

/// A fixed key set, for pinned keys and tests.
#[async_trait]
impl KeySetSource for JwkSet {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        Ok(self.clone())
    }
}

/// Fetches a standard JWKS document over HTTP(S).
pub struct HttpKeySetSource {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySetSource {
    /// Create a source for `url` with a per-fetch timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.into(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        debug!(url = %self.url, "Fetching JWKS");
        self.http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeySetFetch(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySetFetch(e.to_string()))
    }
}

/// An immutable, timestamped key set.
#[derive(Debug)]
pub struct KeySet {
    keys: JwkSet,
    fetched_at: Instant,
}

impl KeySet {
    /// The verification keys.
    #[must_use]
    pub fn keys(&self) -> &JwkSet {
        &self.keys
    }

    /// When this set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Default)]
struct RefreshState {
    current: Option<Arc<KeySet>>,
    inflight: bool,
}

/// Time-bounded cache of one key set with single-flight refresh.
pub struct KeySetCache {
    source: Box<dyn KeySetSource>,
    state: Mutex<RefreshState>,
    refreshed: Notify,
    ttl: Duration,
    refresh_wait: Duration,
}

impl KeySetCache {
    /// Create an empty cache over `source`.
    pub fn new(source: impl KeySetSource + 'static, ttl: Duration, refresh_wait: Duration) -> Self {
        Self {
            source: Box::new(source),
            state: Mutex::new(RefreshState::default()),
            refreshed: Notify::new(),
            ttl,
            refresh_wait,
        }
    }

    /// Return a fresh key set, fetching it if the cached one is missing or stale.
    ///
    /// # Errors
    ///
    /// Returns the fetch error if this caller performed the fetch and it failed.
    pub async fn get(&self) -> Result<Arc<KeySet>, AuthError> {
        loop {
            let notified = {
                let mut state = self.state.lock();
                if let Some(set) = state.current.as_ref().filter(|s| s.is_fresh(self.ttl)) {
                    return Ok(Arc::clone(set));
                }
                if !state.inflight {
                    state.inflight = true;
                    None
                } else {
                    // Created under the lock: the completion broadcast happens
                    // after the flag is cleared, so it cannot be missed.
                    Some(self.refreshed.notified())
                }
            };

            match notified {
                None => return self.refresh().await,
                Some(notified) => {
                    let _ = tokio::time::timeout(self.refresh_wait, notified).await;
                }
            }
        }
    }

    /// Fetch once at startup. Returns the number of keys cached.
    pub async fn warm(&self) -> Result<usize, AuthError> {
        Ok(self.get().await?.keys().keys.len())
    }

    async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let _slot = InflightSlot { cache: self };
        match self.source.fetch().await {
            Ok(keys) => {
                debug!(keys = keys.keys.len(), "Key set refreshed");
                let set = Arc::new(KeySet {
                    keys,
                    fetched_at: Instant::now(),
                });
                self.state.lock().current = Some(Arc::clone(&set));
                Ok(set)
            }
            Err(e) => {
                warn!(error = %e, "Key set refresh failed");
                Err(e)
            }
        }
    }
}

/// Releases the in-flight slot and wakes waiters, including when the
/// fetching future is dropped mid-flight.
struct InflightSlot<'a> {
    cache: &'a KeySetCache,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.cache.state.lock().inflight = false;
        self.cache.refreshed.notify_waiters();
    }
}
