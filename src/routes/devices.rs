//! Device listing and status endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use crate::spark::commands;
use crate::AppState;

/// `GET /devices` — ids of every connected pod. Always succeeds.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let devices = state.registry.list_devices().await;
    Json(json!({ "devices": devices }))
}

/// `GET /device/{id}/status/` — poll the pod's full status.
///
/// Unknown device ids and dispatch failures both surface as a 500 with
/// `{"error":"cannot get status"}`.
pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(session) = state.registry.lookup(&id).await else {
        warn!(device_id = %id, "status requested for unknown device");
        return status_error();
    };
    match commands::get_status(&session).await {
        Ok(status) => Json(json!({ "status": status })).into_response(),
        Err(e) => {
            warn!(device_id = %id, error = %e, "status request failed");
            status_error()
        }
    }
}

fn status_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "cannot get status" })),
    )
        .into_response()
}
