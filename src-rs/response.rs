use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

pub fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({ "success": true, "data": data }))).into_response()
}

pub fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

/// Error envelope with extra machine-readable fields, e.g. balance on 402.
pub fn failure_with(status: StatusCode, message: impl Into<String>, details: Value) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into(), "details": details })),
    )
        .into_response()
}

pub fn internal_error() -> Response {
    failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}
