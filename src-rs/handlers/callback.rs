use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::Response,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::{
    generation::{apply_callback, CallbackAck},
    kie::parse_callback,
    response::{failure, success},
    state::AppState,
};

/// Vendor webhook. 2xx tells the vendor to stop retrying, so only storage
/// failures answer 5xx.
pub async fn kie_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.config.kie_callback_secret.as_deref() {
        let provided = params.get("token").map(String::as_str).unwrap_or_default();
        if !bool::from(secret.as_bytes().ct_eq(provided.as_bytes())) {
            tracing::warn!("KIE callback rejected: bad token");
            return failure(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, "invalid KIE callback body");
            return failure(StatusCode::BAD_REQUEST, "Invalid JSON body");
        }
    };

    let event = match parse_callback(&payload) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(error = %error, "unusable KIE callback payload");
            return failure(StatusCode::BAD_REQUEST, error.to_string());
        }
    };

    let task_id = event.task_id.clone();
    match apply_callback(&state, event).await {
        Ok(CallbackAck::UnknownTask) => {
            success(json!({ "taskId": task_id, "acknowledged": true, "status": null }))
        }
        Ok(CallbackAck::Applied(status)) => {
            success(json!({ "taskId": task_id, "acknowledged": true, "status": status }))
        }
        Err(error) => {
            tracing::error!(error = %error, task_id = %task_id, "failed to apply KIE callback");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Callback processing failed")
        }
    }
}
