//! Proxy Server - Axum HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::proxy::blocklist::REFRESH_INTERVAL;
use crate::proxy::config::ProxyConfig;
use crate::proxy::handlers::{control, forward};
use crate::proxy::middleware::auth_middleware;
use crate::proxy::rate_limit::SWEEP_INTERVAL;
use crate::proxy::router::ProxyRouter;

const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProxyRouter>,
    /// Bearer token clients must present; empty disables the check.
    pub auth_key: Arc<str>,
}

impl AppState {
    pub fn new(router: Arc<ProxyRouter>, auth_key: &str) -> Self {
        Self {
            router,
            auth_key: Arc::from(auth_key),
        }
    }
}

/// Assemble the HTTP surface around `state`.
///
/// `GET /` and `POST /select` are control operations; every other
/// method/path pair is forwarded upstream.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(control::status).fallback(forward::forward))
        .route("/select", post(control::select).fallback(forward::forward))
        .fallback(forward::forward)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Proxy server instance
pub struct ProxyServer {
    settings: ProxyConfig,
    state: AppState,
}

impl ProxyServer {
    pub fn new(settings: ProxyConfig, router: Arc<ProxyRouter>) -> Self {
        let state = AppState::new(router, &settings.auth_key);
        Self { settings, state }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let router = ProxyRouter::from_config(config).await?;
        Ok(Self::new(ProxyConfig::from_config(config), Arc::new(router)))
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.state.router
    }

    /// Run the proxy server (blocking)
    pub async fn run(self) -> anyhow::Result<()> {
        let router = Arc::clone(&self.state.router);

        let sweeper = router
            .limiter()
            .settings()
            .enabled
            .then(|| router.limiter().spawn_sweeper(SWEEP_INTERVAL));
        let refresher = router.blocklist().spawn_refresher(REFRESH_INTERVAL);

        let app = build_app(self.state);

        let addr = self.settings.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Proxy server listening on {}", addr);
        if !self.settings.auth_enabled() {
            tracing::warn!("No auth key configured, forwarding is open to any client");
        }

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        for task in sweeper.into_iter().chain(refresher) {
            task.abort();
        }

        served?;
        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
