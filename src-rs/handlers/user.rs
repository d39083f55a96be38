use axum::{
    extract::{rejection::QueryRejection, Extension, Query, State},
    response::Response,
};
use serde::{Deserialize, Serialize};

use super::query_params;
use crate::{
    middleware::AuthenticatedUser,
    plans::MembershipTier,
    response::{internal_error, success},
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    id: String,
    email: Option<String>,
    credits: i64,
    membership_tier: MembershipTier,
    membership_status: Option<String>,
    free_generations_used: i64,
    free_generations_remaining: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    let profile = match state
        .store
        .ensure_profile(
            &user.user_id,
            user.email.as_deref(),
            state.config.signup_credits,
        )
        .await
    {
        Ok(profile) => profile,
        Err(error) => {
            tracing::error!(error = %error, user_id = %user.user_id, "failed to load profile");
            return internal_error();
        }
    };

    let free_generations_remaining =
        (state.config.free_generation_limit - profile.free_generations_used).max(0);

    success(ProfileResponse {
        id: profile.id,
        email: profile.email,
        credits: profile.credits,
        membership_tier: profile.membership_tier,
        membership_status: profile.membership_status,
        free_generations_used: profile.free_generations_used,
        free_generations_remaining,
    })
}

pub async fn credit_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let query = match query_params(query) {
        Ok(query) => query,
        Err(response) => return response,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    match state.store.list_credit_history(&user.user_id, limit).await {
        Ok(entries) => success(entries),
        Err(error) => {
            tracing::error!(
                error = %error,
                user_id = %user.user_id,
                "failed to load credit history"
            );
            internal_error()
        }
    }
}
