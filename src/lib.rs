//! WebSocket Gateway Library
//!
//! Authenticating, rate-limited reverse proxy for a single WebSocket upstream.
//!
//! # Features
//!
//! - **Admission control**: per-client token buckets in memory, or shared
//!   fixed-window counters in Redis for multi-instance deployments
//! - **Local token verification**: JWT signatures checked against a cached
//!   JWKS with single-flight refresh
//! - **Session introspection fallback**: opaque tokens validated by a remote
//!   service when no key set is configured
//! - **Relay**: `auth_init` identity handshake, bidirectional forwarding,
//!   message size cap and coordinated teardown
//! - **Operations**: health endpoint, Prometheus metrics, structured logs,
//!   graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod relay;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing subscriber: {e}")))
}
