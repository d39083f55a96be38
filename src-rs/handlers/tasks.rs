use axum::{
    extract::{rejection::QueryRejection, Extension, Path, Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::{generation_error_response, query_params};
use crate::{generation, middleware::AuthenticatedUser, response::success, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub limit: Option<usize>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    query: Result<Query<ListTasksQuery>, QueryRejection>,
) -> Response {
    let query = match query_params(query) {
        Ok(query) => query,
        Err(response) => return response,
    };
    let limit = query.limit.unwrap_or(20);
    match generation::list_tasks(&state, &user.user_id, limit).await {
        Ok(tasks) => success(tasks),
        Err(error) => generation_error_response(error),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(task_id): Path<String>,
) -> Response {
    match generation::task_detail(&state, &user.user_id, &task_id).await {
        Ok(detail) => success(detail),
        Err(error) => generation_error_response(error),
    }
}

pub async fn timeout_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(task_id): Path<String>,
) -> Response {
    match generation::timeout_task(&state, &user.user_id, &task_id).await {
        Ok(task) => success(task),
        Err(error) => generation_error_response(error),
    }
}

pub async fn delete_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(task_id): Path<String>,
) -> Response {
    match generation::delete_task(&state, &user.user_id, &task_id).await {
        Ok(()) => success(json!({ "taskId": task_id, "deleted": true })),
        Err(error) => generation_error_response(error),
    }
}
