//! HTTP request handlers: health, on-demand snapshot, discrepancy check,
//! WebSocket stream.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::{error, warn};

use replmon_core::discrepancy::{self, DiscrepancyRequest};

use crate::state::AppState;
use crate::ws;

// ============================================================
// Health
// ============================================================

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    sources: usize,
    subscribers: usize,
}

pub(crate) async fn handle_health(State(hub): AppState) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sources: hub.collector().source_count(),
        subscribers: hub.subscriber_count(),
    })
}

// ============================================================
// Snapshot (pull)
// ============================================================

pub(crate) async fn handle_snapshot(State(hub): AppState) -> Response {
    let snapshot = hub.pull().await;
    match serde_json::to_string(&snapshot) {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode snapshot");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("failed to encode snapshot: {}", e),
            )
                .into_response()
        }
    }
}

// ============================================================
// Discrepancy check
// ============================================================

pub(crate) async fn handle_discrepancy_check(
    State(hub): AppState,
    Json(request): Json<DiscrepancyRequest>,
) -> Response {
    match discrepancy::check(hub.collector(), &request).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => {
            warn!(error = %e, "discrepancy check rejected");
            (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
                .into_response()
        }
    }
}

// ============================================================
// WebSocket stream (push)
// ============================================================

pub(crate) async fn handle_ws(State(hub): AppState, upgrade: WebSocketUpgrade) -> Response {
    upgrade
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| ws::serve_subscriber(hub, socket))
}
