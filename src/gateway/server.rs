//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::metrics;
use super::router::{AppState, create_router};
use crate::admission::{self, AdmissionControl};
use crate::auth::{
    CredentialResolver, HttpKeySetSource, KeySetCache, RemoteSessionValidator, SessionValidator,
    TokenVerifier,
};
use crate::config::{Config, JwksConfig};
use crate::{Error, Result};

/// Longest pause between idle-limiter sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// WebSocket gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway: warm the key set, build the limiter, wire the state.
    pub async fn new(config: Config) -> Result<Self> {
        let verifier = key_set_verifier(&config.jwks).await?;
        let fallback: Arc<dyn SessionValidator> =
            Arc::new(RemoteSessionValidator::new(&config.session)?);
        let admission = admission::from_config(&config.rate_limit).await;

        let state = Arc::new(AppState {
            admission,
            resolver: Arc::new(CredentialResolver::new(verifier, fallback)),
            upstream: config.upstream.clone(),
            trust_proxy_headers: config.server.trust_proxy_headers,
            metrics: config.metrics.enabled.then(metrics::prometheus_handle),
            metrics_path: config.metrics.path.clone(),
        });

        Ok(Self { config, state })
    }

    /// Run the gateway until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let app = create_router(Arc::clone(&self.state));

        info!("============================================================");
        info!("WS GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %listener.local_addr()?, "Listening");
        info!(upstream = %self.config.upstream.url, "Relaying to");
        info!(limiter = self.state.admission.name(), "Admission control");
        if self.state.metrics.is_some() {
            info!(path = %self.config.metrics.path, "Metrics enabled");
        }
        info!("============================================================");

        spawn_idle_sweep(
            Arc::clone(&self.state.admission),
            self.config.rate_limit.idle_eviction,
            shutdown_tx.subscribe(),
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = shutdown_tx.send(());
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Local verification when a key-set endpoint is configured and reachable.
///
/// An unreachable key set at startup disables local verification for the
/// life of the process; every token then goes to the session service.
async fn key_set_verifier(config: &JwksConfig) -> Result<TokenVerifier> {
    let Some(url) = config.endpoint() else {
        info!("No JWKS endpoint configured, tokens are validated by the session service");
        return Ok(TokenVerifier::disabled());
    };

    let source = HttpKeySetSource::new(url, config.fetch_timeout)?;
    let cache = Arc::new(KeySetCache::new(source, config.ttl, config.refresh_wait));
    match cache.warm().await {
        Ok(keys) => {
            info!(url = %url, keys, "JWKS loaded, verifying tokens locally");
            Ok(TokenVerifier::new(cache))
        }
        Err(e) => {
            warn!(url = %url, error = %e, "JWKS unavailable at startup, local verification disabled");
            Ok(TokenVerifier::disabled())
        }
    }
}

/// Periodically drop per-client limiter state that has gone idle.
fn spawn_idle_sweep(
    admission: Arc<dyn AdmissionControl>,
    idle: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if idle.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle.min(MAX_SWEEP_INTERVAL));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = admission.evict_idle(idle);
                    if evicted > 0 {
                        debug!(evicted, "Evicted idle rate limiters");
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    });
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
