mod callback;
mod generate;
mod payment;
mod tasks;
mod uploads;
mod user;

pub use callback::kie_callback;
pub use generate::{generate_image, generate_video};
pub use payment::{create_checkout, create_portal, stripe_webhook};
pub use tasks::{delete_task, get_task, list_tasks, timeout_task};
pub use uploads::upload_image;
pub use user::{credit_history, get_profile};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use serde_json::json;

use crate::{
    generation::GenerationError,
    response::{failure, failure_with, internal_error, success},
    state::AppState,
};

pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => success(json!({ "status": "ok", "database": "ok" })),
        Err(error) => {
            tracing::error!(error = %error, "database health check failed");
            failure(StatusCode::SERVICE_UNAVAILABLE, "Database unreachable")
        }
    }
}

pub async fn not_found() -> Response {
    failure(StatusCode::NOT_FOUND, "Not Found")
}

/// Unwraps a JSON body, answering malformed input with the error envelope.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "rejected request body");
            Err(failure(StatusCode::BAD_REQUEST, "Invalid JSON body"))
        }
    }
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, Response> {
    match query {
        Ok(Query(params)) => Ok(params),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "rejected query string");
            Err(failure(StatusCode::BAD_REQUEST, "Invalid query parameters"))
        }
    }
}

fn generation_error_response(error: GenerationError) -> Response {
    let status = error.status_code();
    match &error {
        GenerationError::InsufficientCredits { balance, required } => failure_with(
            status,
            error.to_string(),
            json!({ "balance": balance, "required": required }),
        ),
        GenerationError::TooEarly { retry_after_secs } => failure_with(
            status,
            error.to_string(),
            json!({ "retryAfterSecs": retry_after_secs }),
        ),
        GenerationError::Provider(_) => failure(status, "Generation provider error"),
        GenerationError::Store(store_error) => {
            tracing::error!(error = %store_error, "task storage failed");
            internal_error()
        }
        GenerationError::Invalid(_) | GenerationError::NotFound => {
            failure(status, error.to_string())
        }
    }
}
