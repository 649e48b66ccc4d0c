//! POST /internal/replay-update, bearer-protected manual re-enqueue.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use courier_queue::types::QUEUE_UPDATES;
use courier_store::types::UpdateStatus;

use crate::app::Services;

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub update_id: i64,
}

pub async fn replay_update(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Json(request): Json<ReplayRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authenticate(&services, &headers)?;

    let update = services.updates.get(request.update_id).map_err(|e| {
        warn!(error = %e, "replay lookup failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal error"})),
        )
    })?;
    if update.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown update_id"})),
        ));
    }

    let enqueue = services
        .queue
        .enqueue(
            QUEUE_UPDATES,
            Some(&format!("update-{}", request.update_id)),
            &json!({ "update_id": request.update_id, "replay": true }),
            None,
        )
        .map_err(|e| {
            warn!(error = %e, "replay enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        })?;
    // A terminal row going back through the pipeline must look enqueued
    // again; non-terminal rows advance normally.
    services
        .updates
        .mark_status(request.update_id, UpdateStatus::Enqueued, None)
        .ok();

    info!(update_id = request.update_id, "update replay requested");
    Ok(Json(json!({
        "ok": true,
        "deduplicated": matches!(enqueue, courier_queue::EnqueueOutcome::Duplicate { .. }),
    })))
}

fn authenticate(
    services: &Arc<Services>,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = services.config.transport.admin_token.as_deref() else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "internal endpoints disabled"})),
        ));
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        ))
    }
}
