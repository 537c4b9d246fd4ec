//! WebSocket command server.
//!
//! One task per connection reads frames in order and answers each command
//! before reading the next; a second task drains the connection's outbound
//! queue, which is shared with [`Broadcaster`].

mod connection;
pub mod envelope;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::modules::{CommandModule, CommandRegistry};

pub use self::registry::{
    BroadcastReport, Broadcaster, ClientRegistry, ConnectionContext, ConnectionId, DeliveryError,
    Session,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind command server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("command server i/o failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("command server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub(crate) struct AppState<M> {
    clients: ClientRegistry,
    commands: Arc<CommandRegistry<M>>,
    metrics: Option<PrometheusHandle>,
}

pub struct CommandServer<M> {
    clients: ClientRegistry,
    commands: Arc<CommandRegistry<M>>,
    metrics: Option<PrometheusHandle>,
}

impl<M: CommandModule> CommandServer<M> {
    pub fn new(module: M) -> Self {
        Self {
            clients: ClientRegistry::new(),
            commands: Arc::new(CommandRegistry::new(module)),
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from this recorder handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            clients: self.clients.clone(),
            commands: Arc::clone(&self.commands),
            metrics: self.metrics.clone(),
        });
        Router::new()
            .route("/", get(connection::ws_handler::<M>))
            .route("/healthz", get(health_handler))
            .route("/metrics", get(metrics_handler::<M>))
            .with_state(state)
    }

    /// Bind `addr` and start serving. Resolves once the listener is bound.
    pub async fn listen(self, addr: SocketAddr) -> Result<ListeningServer, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::Io)?;
        let router = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(%local_addr, "command server listening");
        Ok(ListeningServer {
            local_addr,
            clients: self.clients,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// A bound, running command server.
pub struct ListeningServer {
    local_addr: SocketAddr,
    clients: ClientRegistry,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ListeningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.clients.broadcaster()
    }

    /// Delivery failures from broadcasts and socket writes.
    pub fn errors(&self) -> broadcast::Receiver<DeliveryError> {
        self.clients.errors()
    }

    /// Stop accepting connections and wait for the listener to wind down.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        if self.shutdown.send(()).is_err() {
            warn!("command server stopped before shutdown was requested");
        }
        self.task.await?.map_err(ServerError::Io)?;
        info!(local_addr = %self.local_addr, "command server stopped");
        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler<M: CommandModule>(
    axum::extract::State(state): axum::extract::State<Arc<AppState<M>>>,
) -> axum::response::Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
