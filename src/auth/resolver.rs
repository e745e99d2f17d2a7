//! Turns an `Authorization` header into a [`CredentialDecision`].

use std::sync::Arc;

use tracing::debug;

use super::{AuthError, CredentialDecision, Identity, SessionValidator, TokenVerifier};

/// Shortest header that can hold a scheme, a space and a token.
pub const MIN_AUTHORIZATION_LEN: usize = 8;

/// Local verification first, remote validation only when local has no verdict.
pub struct CredentialResolver {
    verifier: TokenVerifier,
    fallback: Arc<dyn SessionValidator>,
}

impl CredentialResolver {
    /// Create a resolver.
    pub fn new(verifier: TokenVerifier, fallback: Arc<dyn SessionValidator>) -> Self {
        Self { verifier, fallback }
    }

    /// Resolve the raw `Authorization` header value.
    pub async fn resolve(&self, authorization: Option<&str>) -> CredentialDecision {
        match self.identify(authorization).await {
            Ok(identity) => CredentialDecision::Verified(identity),
            Err(reason) => CredentialDecision::Rejected(reason),
        }
    }

    async fn identify(&self, authorization: Option<&str>) -> Result<Identity, AuthError> {
        let token = bearer_token(authorization)?;
        if let Some(identity) = self.verifier.verify(token).await? {
            return Ok(identity);
        }
        debug!("No local verdict, asking session service");
        self.fallback.validate(token).await
    }
}

/// Extract the token from `<scheme> <token>`. The scheme is not checked.
fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthError> {
    let header = authorization
        .filter(|h| h.len() >= MIN_AUTHORIZATION_LEN)
        .ok_or(AuthError::MissingCredential)?;
    let (_scheme, token) = header
        .split_once(' ')
        .ok_or(AuthError::MalformedCredential)?;
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedCredential);
    }
    Ok(token)
}
