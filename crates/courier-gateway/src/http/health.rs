use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::Services;

/// GET /healthz: liveness only.
pub async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// GET /readyz: pings the relational store, the KV store, and the queue.
/// Any failure returns 503 with the failing component named.
pub async fn readyz(
    State(services): State<Arc<Services>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut failures: Vec<String> = Vec::new();

    if let Err(e) = services.updates.get(0) {
        failures.push(format!("relational: {e}"));
    }
    if let Err(e) = services.kv.ping().await {
        failures.push(format!("kv: {e}"));
    }
    let queue_depth = match services.queue.total_depth() {
        Ok(depth) => Some(depth),
        Err(e) => {
            failures.push(format!("queue: {e}"));
            None
        }
    };

    if failures.is_empty() {
        Ok(Json(json!({
            "status": "ready",
            "queue_depth": queue_depth,
        })))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready", "failures": failures})),
        ))
    }
}
