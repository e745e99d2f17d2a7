//! Local bearer-token verification against the cached key set.
//!
//! 1. Fetch the key set (cached, see [`KeySetCache`]).
//! 2. Decode the JWT header to get `kid` and `alg`.
//! 3. Select the key by `kid`. A token without `kid` is accepted only when
//!    the set holds exactly one key.
//! 4. Verify the signature with the header algorithm. The key type must
//!    match the algorithm family.
//! 5. Enforce `exp` with zero leeway when present. Tokens without `exp` are
//!    accepted.
//!
//! Only `sub` and `name` are read from the claims. Audience and issuer are
//! not checked.

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{AuthError, Identity, KeySetCache, Subject};

/// Claims read from a verified token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    name: Option<Value>,
}

/// Verifies bearer tokens locally, or declines when no key set is configured.
#[derive(Clone)]
pub struct TokenVerifier {
    keys: Option<Arc<KeySetCache>>,
}

impl TokenVerifier {
    /// Verifier backed by `keys`.
    #[must_use]
    pub fn new(keys: Arc<KeySetCache>) -> Self {
        Self { keys: Some(keys) }
    }

    /// Verifier that never reaches a verdict.
    #[must_use]
    pub fn disabled() -> Self {
        Self { keys: None }
    }

    /// Whether local verification is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.keys.is_some()
    }

    /// Verify `token`.
    ///
    /// Returns `Ok(None)` when local verification is disabled; the caller
    /// should then ask another authority. Any `Err` is definitive.
    pub async fn verify(&self, token: &str) -> Result<Option<Identity>, AuthError> {
        let Some(cache) = &self.keys else {
            return Ok(None);
        };

        let set = cache.get().await?;
        let header = jsonwebtoken::decode_header(token)?;
        let jwk = select_key(set.keys(), header.kid.as_deref())?;
        let key = DecodingKey::from_jwk(jwk)?;

        let data = jsonwebtoken::decode::<TokenClaims>(token, &key, &validation_for(header.alg))
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e),
            })?;

        let identity = Identity {
            subject: data.claims.sub.and_then(Subject::from_value),
            username: data
                .claims
                .name
                .and_then(|v| v.as_str().map(str::to_owned)),
        };
        debug!(subject = ?identity.subject, "Token verified locally");
        Ok(Some(identity))
    }
}

fn select_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk, AuthError> {
    match kid {
        Some(kid) => jwks
            .find(kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string())),
        None => match jwks.keys.as_slice() {
            [only] => Ok(only),
            keys => Err(AuthError::MissingKeyId(keys.len())),
        },
    }
}

fn validation_for(alg: Algorithm) -> Validation {
    let mut v = Validation::new(alg);
    v.leeway = 0;
    v.validate_aud = false;
    // `exp` is checked when present but not required
    v.required_spec_claims.clear();
    v
}
