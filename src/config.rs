//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
    value::{Uncased, UncasedStr},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Prefix for structured environment overrides (`WS_GATEWAY_JWKS__URL=...`).
pub const ENV_PREFIX: &str = "WS_GATEWAY_";

/// Older names for the session settings. Merged below [`ENV_ALIASES`], so
/// `SESSION_VALIDATE_URL` beats `NAKAMA_RPC_URL` and `SESSION_HTTP_KEY` beats
/// `NAKAMA_HTTP_KEY` when both are set.
const LEGACY_ENV_ALIASES: &[(&str, &str)] = &[
    ("NAKAMA_RPC_URL", "session.url"),
    ("NAKAMA_HTTP_KEY", "session.http_key"),
];

/// Flat environment variables understood for compatibility with existing
/// deployments, mapped onto their nested config keys.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("JWKS_URL", "jwks.url"),
    ("WORLD_WS", "upstream.url"),
    ("SESSION_VALIDATE_URL", "session.url"),
    ("SESSION_HTTP_KEY", "session.http_key"),
    ("RATE_LIMIT_RPS", "rate_limit.requests_per_second"),
    ("RATE_LIMIT_BURST", "rate_limit.burst_size"),
    ("USE_REDIS_RATE", "rate_limit.redis.enabled"),
    ("REDIS_URL", "rate_limit.redis.url"),
    ("METRICS_PATH", "metrics.path"),
];

/// Routes the gateway always serves.
const RESERVED_PATHS: &[&str] = &["/health", "/ws"];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load into the process environment at startup.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Upstream WebSocket target
    pub upstream: UpstreamConfig,
    /// Local bearer-token verification
    pub jwks: JwksConfig,
    /// Remote session-introspection fallback
    pub session: SessionConfig,
    /// Admission control
    pub rate_limit: RateLimitConfig,
    /// Prometheus exposition
    pub metrics: MetricsConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Derive the client identifier from `X-Real-IP` / `X-Forwarded-For`
    /// before falling back to the peer address.
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            trust_proxy_headers: true,
        }
    }
}

/// Upstream WebSocket target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` URL dialed for every authenticated session
    pub url: String,
    /// Bound on the upstream dial + WebSocket handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Largest single message relayed in either direction, in bytes
    pub max_message_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://world:8090/ws".to_string(),
            handshake_timeout: Duration::from_secs(5),
            max_message_size: 1 << 20,
        }
    }
}

/// Local bearer-token verification against a remote key set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// Key-set endpoint. Unset or empty disables local verification.
    pub url: Option<String>,
    /// How long a fetched key set stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Upper bound on one wait for an in-flight refresh before re-checking
    #[serde(with = "humantime_serde")]
    pub refresh_wait: Duration,
    /// HTTP timeout for a key-set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl: Duration::from_secs(300),
            refresh_wait: Duration::from_millis(200),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl JwksConfig {
    /// The configured endpoint, treating an empty string as unset.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

/// Remote session-introspection fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Introspection endpoint (HTTP POST)
    pub url: String,
    /// Shared secret passed as the `http_key` query parameter
    pub http_key: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "http://nakama:7350/v2/rpc/validate_session".to_string(),
            http_key: "defaulthttpkey".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Steady request rate per client
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
    /// Drop in-memory limiters idle for this long
    #[serde(with = "humantime_serde")]
    pub idle_eviction: Duration,
    /// Shared counter store
    pub redis: RedisConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            burst_size: 10,
            idle_eviction: Duration::from_secs(600),
            redis: RedisConfig::default(),
        }
    }
}

/// Shared counter store for the fixed-window strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Use the shared store instead of in-process limiters
    pub enabled: bool,
    /// Connection string
    pub url: String,
    /// Bound on connect + PING at startup
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://redis:6379/0".to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Prometheus exposition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the exposition endpoint
    pub enabled: bool,
    /// Route for the exposition endpoint
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files feed the environment layers below, so they load first
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        let config: Self = figment
            .merge(Env::raw().filter_map(legacy_env_alias))
            .merge(Env::raw().filter_map(env_alias))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        check_url("upstream.url", &self.upstream.url, &["ws", "wss"])?;
        check_url("session.url", &self.session.url, &["http", "https"])?;
        if let Some(url) = self.jwks.endpoint() {
            check_url("jwks.url", url, &["http", "https"])?;
        }
        if self.upstream.max_message_size == 0 {
            return Err(Error::Config(
                "upstream.max_message_size must be greater than zero".to_string(),
            ));
        }
        if !self.metrics.path.starts_with('/') {
            return Err(Error::Config(format!(
                "metrics.path must start with '/': {}",
                self.metrics.path
            )));
        }
        if RESERVED_PATHS.contains(&self.metrics.path.as_str()) {
            return Err(Error::Config(format!(
                "metrics.path collides with a built-in route: {}",
                self.metrics.path
            )));
        }
        Ok(())
    }

    /// Copy of this configuration safe to print (shared secret redacted).
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.session.http_key.is_empty() {
            copy.session.http_key = "***".to_string();
        }
        copy
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(env_files: &[String]) {
    for path_str in env_files {
        let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
            (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
            _ => path_str.clone(),
        };

        let path = Path::new(&expanded);
        if !path.exists() {
            tracing::debug!("Env file not found (skipped): {expanded}");
            continue;
        }
        match dotenvy::from_path(path) {
            Ok(()) => tracing::info!("Loaded env file: {expanded}"),
            Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
        }
    }
}

/// Map a flat compatibility variable onto its nested config key.
fn env_alias(key: &UncasedStr) -> Option<Uncased<'_>> {
    lookup_alias(ENV_ALIASES, key)
}

fn legacy_env_alias(key: &UncasedStr) -> Option<Uncased<'_>> {
    lookup_alias(LEGACY_ENV_ALIASES, key)
}

fn lookup_alias(table: &[(&str, &'static str)], key: &UncasedStr) -> Option<Uncased<'static>> {
    table
        .iter()
        .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
        .map(|(_, target)| Uncased::from(*target))
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("{field}: {e}")))?;
    if schemes.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{field}: unsupported scheme '{}' (expected one of {schemes:?})",
            url.scheme()
        )))
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (`"250ms"` or `"30s"`)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"` or a bare number of seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before the bare "s" and "m" suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
