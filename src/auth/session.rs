//! Remote session validation.
//!
//! Used only when local token verification has no verdict. The service is
//! called with `POST <url>?http_key=<key>` and a JSON body `{"token": ...}`;
//! it answers `{"valid": bool, "sub": ..., "username": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{AuthError, Identity, Subject};
use crate::config::SessionConfig;

/// An external authority that vouches for opaque session tokens.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Validate `token`, returning the identity it belongs to.
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

/// Response body. Parsed leniently: fields of the wrong type count as absent.
#[derive(Debug, Default, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    valid: Value,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    username: Option<Value>,
}

impl ValidateResponse {
    fn into_identity(self) -> Result<Identity, AuthError> {
        if self.valid != Value::Bool(true) {
            return Err(AuthError::SessionRejected);
        }
        Ok(Identity {
            subject: self.sub.and_then(Subject::from_value),
            username: self.username.and_then(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            }),
        })
    }
}

/// HTTP client for the session-introspection service.
pub struct RemoteSessionValidator {
    url: String,
    http_key: String,
    http: reqwest::Client,
}

impl RemoteSessionValidator {
    /// Build a validator from configuration.
    pub fn new(config: &SessionConfig) -> Result<Self, reqwest::Error> {
        Self::with_timeout(&config.url, &config.http_key, config.timeout)
    }

    /// Build a validator for `url` with a shared key and a per-call timeout.
    pub fn with_timeout(
        url: impl Into<String>,
        http_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.into(),
            http_key: http_key.into(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl SessionValidator for RemoteSessionValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let response = self
            .http
            .post(&self.url)
            .query(&[("http_key", self.http_key.as_str())])
            .json(&ValidateRequest { token })
            .send()
            .await
            .map_err(|e| AuthError::SessionUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::SessionUnavailable(format!(
                "status={} body={}",
                status.as_u16(),
                body.trim()
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| AuthError::SessionUnavailable(e.to_string()))?;
        debug!(valid = %body.valid, "Session introspection answered");
        body.into_identity()
    }
}
