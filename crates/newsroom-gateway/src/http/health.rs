use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness check with queue depth.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let scheduler = match state.scheduler.status() {
        Ok(status) => json!({
            "running": status.running.is_some(),
            "pending": status.counts.pending,
        }),
        Err(e) => json!({ "error": e.code() }),
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler": scheduler,
        "poll_interval_secs": state.config.scheduler.poll_interval().as_secs(),
    }))
}
