//! Credential resolution for inbound sessions.
//!
//! # Verification chain
//!
//! 1. [`TokenVerifier`] checks the bearer token locally against a cached
//!    key set ([`KeySetCache`]). When no key-set endpoint is configured it
//!    returns no verdict.
//! 2. Only on "no verdict", [`RemoteSessionValidator`] asks the external
//!    session-introspection service.
//!
//! A definitive local failure (bad signature, expired token) never falls
//! through to the remote service. The two sources never merge fields: the
//! [`Identity`] comes entirely from whichever one decided.

pub mod jwks;
pub mod resolver;
pub mod session;
pub mod verifier;

pub use jwks::{HttpKeySetSource, KeySet, KeySetCache, KeySetSource};
pub use resolver::{CredentialResolver, MIN_AUTHORIZATION_LEN};
pub use session::{RemoteSessionValidator, SessionValidator};
pub use verifier::TokenVerifier;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error variants for credential rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header, or one too short to hold a scheme and token.
    #[error("missing Authorization header")]
    MissingCredential,

    /// The header has no `<scheme> <token>` shape.
    #[error("malformed Authorization header")]
    MalformedCredential,

    /// The key set could not be fetched.
    #[error("jwks fetch: {0}")]
    KeySetFetch(String),

    /// JWT decode / signature verification failed.
    #[error("jwt parse/verify: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// Signature is valid but the `exp` claim is in the past.
    #[error("token expired")]
    TokenExpired,

    /// The JWT header names no `kid` and the key set is ambiguous.
    #[error("jwt parse/verify: token has no 'kid' and the key set holds {0} keys")]
    MissingKeyId(usize),

    /// The `kid` in the JWT header is not in the key set.
    #[error("jwt parse/verify: unknown key id '{0}'")]
    UnknownKeyId(String),

    /// The introspection service could not be reached or answered non-200.
    #[error("session validate failed: {0}")]
    SessionUnavailable(String),

    /// The introspection service answered but did not vouch for the token.
    #[error("session: token invalid")]
    SessionRejected,
}

/// Opaque subject identifier: services hand out either strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    /// String subject (UUIDs, usernames, ...)
    Text(String),
    /// Numeric subject
    Number(serde_json::Number),
}

impl Subject {
    /// Accept string or number JSON values; anything else is treated as absent.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s)),
            Value::Number(n) => Some(Self::Number(n)),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Text(s) if s.is_empty())
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Resolved identity of an authenticated client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject identifier
    #[serde(rename = "sub", skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Identity {
    /// Identity with both fields set.
    #[must_use]
    pub fn new(subject: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            subject: Some(Subject::Text(subject.into())),
            username: Some(username.into()),
        }
    }

    /// Build the `auth_init` handshake sent to the upstream before any relayed
    /// traffic. Absent and empty fields are omitted.
    #[must_use]
    pub fn handshake(&self) -> Value {
        let mut init = serde_json::Map::new();
        init.insert("t".to_string(), Value::from("auth_init"));
        if let Some(sub) = self.subject.as_ref().filter(|s| !s.is_empty()) {
            let value = match sub {
                Subject::Text(s) => Value::from(s.as_str()),
                Subject::Number(n) => Value::Number(n.clone()),
            };
            init.insert("sub".to_string(), value);
        }
        if let Some(name) = self.username.as_deref().filter(|n| !n.is_empty()) {
            init.insert("username".to_string(), Value::from(name));
        }
        Value::Object(init)
    }
}

/// Outcome of credential resolution. Terminal for one session attempt.
#[derive(Debug)]
pub enum CredentialDecision {
    /// The credential was accepted
    Verified(Identity),
    /// The credential was refused
    Rejected(AuthError),
}
