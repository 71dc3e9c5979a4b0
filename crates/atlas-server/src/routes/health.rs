//! Liveness and backing-store health checks

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /v1/health - liveness
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": atlas_core::VERSION,
    }))
}

/// GET /v1/health/detailed - backing-store checks and consumer lag
pub async fn health_detailed(
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let event_store = match state.events.stats() {
        Ok(stats) => json!({"status": "ok", "streamLength": stats.stream_length, "groups": stats.groups}),
        Err(error) => json!({"status": "down", "error": error.to_string()}),
    };
    let graph_store = match state.graph.count_nodes_by_kind() {
        Ok(counts) => json!({"status": "ok", "nodes": counts}),
        Err(error) => json!({"status": "down", "error": error.to_string()}),
    };

    let healthy = event_store["status"] == "ok" && graph_store["status"] == "ok";
    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": atlas_core::VERSION,
        "eventStore": event_store,
        "graphStore": graph_store,
        "metrics": state.metrics.snapshot(),
    }));
    if healthy {
        Ok(body)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
