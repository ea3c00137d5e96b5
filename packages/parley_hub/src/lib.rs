// Library interface for the parley conversation hub.
// Exposes the orchestration engine for embedding and for integration tests.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod responder;
pub mod storage;
pub mod ws;

pub use hub::{ConversationHandle, HubManager};

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;

use crate::auth::AuthHook;
use crate::metrics::HealthStatus;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<HubManager>,
    pub auth: Arc<dyn AuthHook>,
}

/// HTTP surface: the WebSocket upgrade plus health and metrics probes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{conversation_id}", get(ws::ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check endpoint - returns hub status and headline counts
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.manager.metrics().snapshot();
    let status = if snapshot.errors.storage_writes == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthStatus {
        status: status.to_string(),
        conversations: state.manager.conversation_count().await as u64,
        connections: snapshot.connections.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed hub metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.metrics().snapshot())
}
