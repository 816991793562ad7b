//! HTTP handlers.

pub mod files;
pub mod realtime;
pub mod sessions;

use crate::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Json};

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "harbor-server",
        "droppedMessages": state.bus.dropped_total(),
    }))
}
