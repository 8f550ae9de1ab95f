//! Proxy server lifecycle
//!
//! Binds the HTTP listener, serves the proxy and health routes until the
//! shutdown future resolves, then closes every remaining target connection.

use crate::handler;
use crate::registry::SessionRegistry;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Path of the liveness endpoint
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// HTTP path of the proxy endpoint
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            path: "/proxy".to_string(),
        }
    }
}

/// Ensure the path has exactly one leading slash
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Build the router with the registry injected as shared state
pub fn build_router(registry: Arc<SessionRegistry>, path: &str) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handler::health))
        .route(&normalize_path(path), post(handler::proxy))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
}

pub struct ProxyServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::new()))
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Router {
        build_router(self.registry.clone(), &self.config.path)
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: self.config.listen_addr,
                source,
            })
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// In-flight requests are allowed to finish; afterwards every session
    /// still registered is shut down.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let router = self.router();
        info!(
            "Proxy server listening on {} (path {})",
            addr,
            normalize_path(&self.config.path)
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        let closed = self.registry.shutdown_all().await;
        info!(sessions_closed = closed, "Proxy server shutdown");
        Ok(())
    }
}
