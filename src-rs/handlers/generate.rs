use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    response::Response,
    Json,
};
use serde::Deserialize;

use super::{generation_error_response, json_body};
use crate::{
    catalog::MediaKind,
    generation::{start_generation, GenerationInput},
    middleware::AuthenticatedUser,
    response::success,
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    pub model: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Single first-frame image used by the video form.
    pub image_url: Option<String>,
    pub aspect_ratio: Option<String>,
}

impl GenerateRequest {
    fn into_input(self, kind: MediaKind) -> GenerationInput {
        let mut image_urls: Vec<String> = self
            .image_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if let Some(url) = self.image_url.map(|url| url.trim().to_string()) {
            if !url.is_empty() && !image_urls.contains(&url) {
                image_urls.insert(0, url);
            }
        }

        GenerationInput {
            kind,
            prompt: self.prompt,
            model: self.model,
            image_urls,
            aspect_ratio: self
                .aspect_ratio
                .map(|ratio| ratio.trim().to_string())
                .filter(|ratio| !ratio.is_empty()),
        }
    }
}

pub async fn generate_image(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    generate(state, user, payload, MediaKind::Image).await
}

pub async fn generate_video(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    generate(state, user, payload, MediaKind::Video).await
}

async fn generate(
    state: AppState,
    user: AuthenticatedUser,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
    kind: MediaKind,
) -> Response {
    let body = match json_body(payload) {
        Ok(body) => body,
        Err(response) => return response,
    };

    match start_generation(&state, &user, body.into_input(kind)).await {
        Ok(started) => success(started),
        Err(error) => generation_error_response(error),
    }
}
