//! Webhook ingress: POST /webhook and POST /webhook/{secret}.
//!
//! Persist-then-ack: the durable insert is the acknowledgement point; the
//! work queue is fed asynchronously and the recovery sweep covers any gap.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::Services;
use crate::ingest::IngestOutcome;

const SECRET_HEADER: &str = "x-courier-secret-token";

pub async fn webhook_handler(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    accept(&services, &headers, None, payload)
}

pub async fn webhook_handler_with_secret(
    State(services): State<Arc<Services>>,
    Path(secret): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    accept(&services, &headers, Some(&secret), payload)
}

fn accept(
    services: &Arc<Services>,
    headers: &HeaderMap,
    path_secret: Option<&str>,
    payload: Value,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authenticate(services, headers, path_secret)?;

    let outcome = services.ingestor.ingest(&payload).map_err(|e| {
        warn!(error = %e, "webhook ingest failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal error"})),
        )
    })?;

    match outcome {
        IngestOutcome::Accepted { update_id } => {
            info!(update_id, "webhook update accepted");
            Ok(Json(json!({"ok": true, "update_id": update_id})))
        }
        IngestOutcome::Duplicate { update_id } => {
            info!(update_id, "duplicate webhook delivery");
            Ok(Json(json!({"ok": true, "duplicate": true})))
        }
        IngestOutcome::MissingId => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "payload has no numeric update_id"})),
        )),
    }
}

/// Accept when the header or the URL segment carries the configured
/// secret. No configured secret means an open endpoint (warned at boot).
fn authenticate(
    services: &Arc<Services>,
    headers: &HeaderMap,
    path_secret: Option<&str>,
) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = services.config.transport.webhook_secret.as_deref() else {
        return Ok(());
    };

    let header_ok = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    let path_ok = path_secret.map(|s| s == expected).unwrap_or(false);

    if header_ok || path_ok {
        Ok(())
    } else {
        warn!("webhook secret mismatch");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        ))
    }
}
