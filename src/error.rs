//! Error types for the gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level gateway errors.
///
/// Per-session failures (credential rejection, relay faults) have their own
/// types in [`crate::auth`] and [`crate::relay`]; this enum covers startup and
/// process-level failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store (Redis) error
    #[error("Counter store error: {0}")]
    Store(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
