//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, MatchedPath, Request, State,
        ws::{Message, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::metrics;
use crate::admission::AdmissionControl;
use crate::auth::{CredentialDecision, CredentialResolver};
use crate::config::UpstreamConfig;
use crate::relay::{self, FrameSocket};

/// Shared application state
pub struct AppState {
    /// Per-client admission control
    pub admission: Arc<dyn AdmissionControl>,
    /// Credential resolution chain
    pub resolver: Arc<CredentialResolver>,
    /// Upstream connection settings
    pub upstream: UpstreamConfig,
    /// Whether `X-Real-IP` / `X-Forwarded-For` identify the client
    pub trust_proxy_headers: bool,
    /// Prometheus handle; `None` disables the metrics route
    pub metrics: Option<PrometheusHandle>,
    /// Route serving metrics
    pub metrics_path: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    if state.metrics.is_some() {
        router = router.route(&state.metrics_path, get(metrics_handler));
    }

    router
        .layer(middleware::from_fn(track_requests))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws: admission, then credentials, then the upgrade itself.
///
/// The upgrade extractor's rejection is held back until both checks pass, so
/// a refused client never learns whether its upgrade request was well formed.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let client = client_key(&headers, peer, state.trust_proxy_headers);

    if !state.admission.allow(&client).await {
        warn!(client = %client, limiter = state.admission.name(), "Rate limit exceeded");
        metrics::record_rate_limited();
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit").into_response();
    }

    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let identity = match state.resolver.resolve(authorization).await {
        CredentialDecision::Verified(identity) => identity,
        CredentialDecision::Rejected(reason) => {
            warn!(client = %client, reason = %reason, "Credential rejected");
            metrics::record_validation_failure();
            return (StatusCode::UNAUTHORIZED, reason.to_string()).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(client = %client, error = %rejection, "Upgrade error");
            return rejection.into_response();
        }
    };

    let span = info_span!("session", id = %Uuid::new_v4(), client = %client);
    let upstream = state.upstream.clone();
    upgrade
        .max_message_size(relay::transport_message_limit(upstream.max_message_size))
        .on_failed_upgrade(|error| warn!(error = %error, "Upgrade error"))
        .on_upgrade(move |socket| {
            async move {
                metrics::record_upgrade();
                info!(subject = ?identity.subject, username = ?identity.username, "Session started");
                let outcome = relay::run(FrameSocket::<_, Message>::new(socket), &upstream, &identity).await;
                if outcome.is_normal() {
                    info!(outcome = %outcome, "Session ended");
                } else {
                    warn!(outcome = %outcome, "Session ended");
                }
            }
            .instrument(span)
        })
}

/// Count every request by matched route.
async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;
    metrics::record_request(route, method, response.status().as_u16());
    response
}

/// Rate-limit key for a request: the forwarded client address when proxy
/// headers are trusted, otherwise the socket peer.
fn client_key(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let forwarded = header("x-real-ip").or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryLimiter;
    use crate::auth::{AuthError, Identity, SessionValidator, TokenVerifier};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request as HttpRequest};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const PEER: &str = "192.0.2.10:40000";

    #[derive(Default)]
    struct StubValidator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionValidator for StubValidator {
        async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token == "good-token" {
                Ok(Identity::new("u1", "alice"))
            } else {
                Err(AuthError::SessionRejected)
            }
        }
    }

    fn app(rps: u32, burst: u32, validator: Arc<StubValidator>) -> Router {
        create_router(Arc::new(AppState {
            admission: Arc::new(MemoryLimiter::new(rps, burst)),
            resolver: Arc::new(CredentialResolver::new(TokenVerifier::disabled(), validator)),
            upstream: UpstreamConfig::default(),
            trust_proxy_headers: true,
            metrics: Some(PrometheusBuilder::new().build_recorder().handle()),
            metrics_path: "/metrics".to_string(),
        }))
    }

    fn request(uri: &str, authorization: Option<&str>) -> HttpRequest<Body> {
        let mut request = HttpRequest::builder().uri(uri).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(PEER.parse::<SocketAddr>().unwrap()));
        if let Some(value) = authorization {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        request
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app(5, 10, Arc::default())
            .oneshot(request("/health", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_route_renders() {
        let response = app(5, 10, Arc::default())
            .oneshot(request("/metrics", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credential_is_unauthorized_without_remote_call() {
        let validator = Arc::new(StubValidator::default());

        let response = app(5, 10, Arc::clone(&validator))
            .oneshot(request("/ws", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "missing Authorization header");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_session_is_unauthorized() {
        let validator = Arc::new(StubValidator::default());

        let response = app(5, 10, Arc::clone(&validator))
            .oneshot(request("/ws", Some("Bearer bad-token")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "session: token invalid");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_precedes_authentication() {
        let validator = Arc::new(StubValidator::default());
        let app = app(1, 1, Arc::clone(&validator));

        let first = app
            .clone()
            .oneshot(request("/ws", Some("Bearer bad-token")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

        let second = app
            .oneshot(request("/ws", Some("Bearer bad-token")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(second).await, "rate limit");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_upgrade_request_is_rejected_after_auth() {
        let validator = Arc::new(StubValidator::default());

        let response = app(5, 10, Arc::clone(&validator))
            .oneshot(request("/ws", Some("Bearer good-token")))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_key_prefers_real_ip_then_forwarded_for() {
        let peer: SocketAddr = PEER.parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, peer, true), "192.0.2.10");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(client_key(&headers, peer, true), "203.0.113.5");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_key(&headers, peer, true), "198.51.100.2");

        // Untrusted proxy headers are ignored
        assert_eq!(client_key(&headers, peer, false), "192.0.2.10");
    }
}
