//! HTTP surface: the WebSocket endpoint, a health probe and the static
//! viewer page.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::client::{display_name, ClientSession};
use crate::config::ClientConfig;
use crate::hub::HubHandle;

/// Errors from the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared by the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub client: ClientConfig,
    pub queue_capacity: usize,
    /// Cleared once the shell's output stream has ended.
    pub shell_running: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    username: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub participants: usize,
    pub shell_running: bool,
}

/// Builds the application router.
pub fn create_router(state: AppState, web_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health))
        .fallback_service(ServeDir::new(web_dir).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listening socket.
pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serves `router` on `listener` until the listener fails.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), ServerError> {
    axum::serve(listener, router).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let name = display_name(params.username.as_deref(), &state.hub);
    tracing::debug!(name = %name, "WebSocket upgrade requested");

    let AppState {
        hub,
        client,
        queue_capacity,
        ..
    } = state;

    ws.max_message_size(client.max_message_size)
        .on_upgrade(move |socket| ClientSession::run(socket, name, hub, client, queue_capacity))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        participants: state.hub.client_count(),
        shell_running: state.shell_running.load(Ordering::Acquire),
    })
}
