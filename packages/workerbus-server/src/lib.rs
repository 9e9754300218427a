pub mod websocket;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use workerbus_core::{HubHandle, WorkerHandle};

/// Shared state handed to every request handler.
pub struct AppState {
    pub worker: WorkerHandle,
    pub hub: HubHandle,
    /// Counter for generating unique connection IDs
    pub next_conn_id: AtomicU64,
    /// Deadline for control commands issued on behalf of subscribers
    pub command_deadline: Duration,
}

impl AppState {
    pub fn new(worker: WorkerHandle, hub: HubHandle) -> Self {
        Self {
            worker,
            hub,
            next_conn_id: AtomicU64::new(1),
            command_deadline: Duration::from_secs(30),
        }
    }
}

/// Build the routes served by the binary.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.worker.status().await {
        Ok(status) => Json(json!({
            "status": "ok",
            "worker": {
                "ready": status.ready,
                "running": status.running,
                "pending": status.pending,
            },
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "error": e.to_string(),
                "timestamp": Utc::now(),
            })),
        )
            .into_response(),
    }
}
