//! `CentralSystem`: device WebSocket listener + operator HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use csms_core::{register_core_handlers, ConnectionRegistry, FallbackPolicy, HandlerRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::control;
use crate::error::ServerError;
use crate::listener::DeviceListener;

/// The central system and everything it shares between connections
pub struct CentralSystem {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<HandlerRegistry>,
    fallback: Arc<FallbackPolicy>,
    shutdown: CancellationToken,
}

impl CentralSystem {
    /// Create a central system answering with the default Core profile handlers
    pub fn new(config: ServerConfig) -> Self {
        let mut handlers = HandlerRegistry::new();
        register_core_handlers(&mut handlers, config.heartbeat_interval);

        Self {
            fallback: Arc::new(config.fallback_policy()),
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            handlers: Arc::new(handlers),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the inbound action handlers
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Token that stops both listeners when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Build the control API router
    pub fn router(&self) -> Router {
        control::router(self.registry.clone())
    }

    /// Bind both listeners without serving yet
    pub async fn bind(self) -> Result<BoundCentralSystem, ServerError> {
        let ws = DeviceListener::bind(
            self.config.clone(),
            self.registry.clone(),
            self.handlers.clone(),
            self.fallback.clone(),
        )
        .await?;

        let http = TcpListener::bind(self.config.http_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.http_bind,
                source,
            })?;

        Ok(BoundCentralSystem {
            system: self,
            ws,
            http,
        })
    }

    /// Bind and serve until shutdown
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.run().await
    }
}

/// A central system whose sockets are bound
pub struct BoundCentralSystem {
    system: CentralSystem,
    ws: DeviceListener,
    http: TcpListener,
}

impl BoundCentralSystem {
    pub fn ws_addr(&self) -> Result<SocketAddr, ServerError> {
        self.ws.local_addr()
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.http.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.system.registry()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.system.shutdown_token()
    }

    /// Serve both listeners until the shutdown token is cancelled, then close
    /// every session.
    pub async fn run(self) -> Result<(), ServerError> {
        let shutdown = self.system.shutdown_token();
        info!("Control API listening on http://{}", self.http_addr()?);

        let ws_task = tokio::spawn(self.ws.run(shutdown.clone()));

        let http_shutdown = shutdown.clone();
        let served = axum::serve(self.http, self.system.router())
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;

        // The HTTP server can also stop on its own after an IO error
        shutdown.cancel();
        if let Err(e) = ws_task.await {
            error!("WebSocket listener task failed: {}", e);
        }

        // Connections that register after this drain see the cancelled token
        // and close themselves
        let closed = self.system.registry.shutdown();
        info!("Central system stopped, {} sessions closed", closed);

        served.map_err(ServerError::Io)
    }
}
