//! HTTP API layer: thin handlers that delegate to the [`Controller`].

pub mod http;
mod response;

use std::sync::Arc;

use thiserror::Error;

use crate::controller::Controller;
use crate::events::EventBus;

pub use http::create_router;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared application state for the API layer. Cheap to clone: every field
/// is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub event_bus: Arc<EventBus>,
}

/// Binds `addr` and serves the router until the future is dropped or the
/// listener errors. Callers race this against a shutdown signal.
pub async fn start_server(addr: std::net::SocketAddr, state: AppState) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| ServerError::Bind(addr, e))?;
    log::info!("[Server] listening on http://{}", addr);
    let app = create_router(state);
    axum::serve(listener, app).await.map_err(ServerError::Serve)?;
    Ok(())
}
