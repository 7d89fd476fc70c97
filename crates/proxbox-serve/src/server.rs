//! Server instance management

use http::HeaderValue;
use axum::Router;
use proxbox_engine::cluster::ProxmoxClient;
use proxbox_engine::ior::NetboxClient;
use proxbox_engine::{ClusterPool, ClusterSession, IorSession, MemoryIor, SyncOrchestrator};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{AppConfig, IorBackend};
use crate::error::ApiError;
use crate::handlers::{create_router, AppState};

/// Proxbox HTTP/WebSocket server
///
/// Owns the IoR session and the cluster pool for the life of the process
/// and serves one sync run per WebSocket control session.
pub struct ProxboxServer {
    state: AppState,
}

impl ProxboxServer {
    /// Create new server instance
    ///
    /// # Arguments
    ///
    /// * `config` - Application configuration
    ///
    /// # Returns
    ///
    /// `Result<ProxboxServer, ApiError>` - Server or error
    pub fn new(config: AppConfig) -> Result<Self, ApiError> {
        if let Err(e) = config.validate() {
            return Err(ApiError::config(format!("Invalid config: {}", e)));
        }

        let timeout = config.sync.call_timeout();

        let ior: Arc<dyn IorSession> = match config.netbox.backend {
            IorBackend::Http => {
                let client = NetboxClient::new(config.netbox.settings(timeout)).map_err(|e| {
                    error!("Failed to create NetBox client: {}", e);
                    ApiError::internal(format!("Failed to create NetBox client: {}", e))
                })?;
                info!("NetBox session: {}", client.base_url());
                Arc::new(client)
            }
            IorBackend::Memory => {
                warn!("Using in-memory IoR; nothing is written to NetBox");
                Arc::new(MemoryIor::new())
            }
        };

        let mut pool = ClusterPool::new();
        for cluster in &config.proxmox {
            let client = ProxmoxClient::new(cluster.settings(timeout)).map_err(|e| {
                error!("Failed to create Proxmox client: {}", e);
                ApiError::internal(format!("Failed to create Proxmox client: {}", e))
            })?;
            info!("Proxmox session: {}", client.name());
            pool.push(Arc::new(client));
        }

        let orchestrator = SyncOrchestrator::new(ior, pool, config.sync.options());
        Ok(Self::from_parts(config, orchestrator))
    }

    /// Create a server around an existing orchestrator
    pub fn from_parts(config: AppConfig, orchestrator: SyncOrchestrator) -> Self {
        Self {
            state: AppState::new(config, orchestrator),
        }
    }

    /// Shared state handed to every handler
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Router with CORS and request tracing applied
    pub fn router(&self) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(self.cors_layer());

        create_router().with_state(self.state.clone()).layer(middleware)
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }

    /// Get socket address for binding
    pub fn socket_addr(&self) -> Result<SocketAddr, ApiError> {
        self.state
            .config
            .socket_addr()
            .map_err(|e| ApiError::internal(format!("Failed to parse address: {}", e)))
    }

    /// Bind the configured address and serve until Ctrl+C or TERM
    pub async fn start(&self) -> Result<(), ApiError> {
        let addr = self.socket_addr()?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind to {}: {:?}", addr, e);
            ApiError::internal(format!("Failed to bind to {}: {}", addr, e))
        })?;

        info!("Server listening on: {}", self.server_url());
        info!("WebSocket endpoint: {}", self.websocket_url());

        self.serve(listener, Self::wait_for_shutdown()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::internal(format!("Server error: {}", e)))
    }

    /// Wait for shutdown signal
    ///
    /// Resolves on Ctrl+C, or on TERM where supported
    pub async fn wait_for_shutdown() {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix;
            match unix::signal(unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    info!("Received TERM signal");
                }
                Err(e) => {
                    error!("Failed to install TERM handler: {}", e);
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
    }

    /// Get server URL
    #[must_use]
    pub fn server_url(&self) -> String {
        let server = &self.state.config.server;
        format!("http://{}:{}", server.host, server.port)
    }

    /// Get WebSocket URL
    #[must_use]
    pub fn websocket_url(&self) -> String {
        let server = &self.state.config.server;
        format!("ws://{}:{}/ws", server.host, server.port)
    }
}

impl std::fmt::Debug for ProxboxServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxboxServer")
            .field("url", &self.server_url())
            .field("clusters", &self.state.orchestrator.pool().names())
            .finish()
    }
}
