use axum::{
    extract::{multipart::MultipartRejection, Extension, Multipart, State},
    http::StatusCode,
    response::Response,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    middleware::AuthenticatedUser,
    response::{failure, success},
    state::AppState,
    upload::{read_image_from_multipart, UploadError},
};

pub async fn upload_image(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "rejected upload body");
            return failure(StatusCode::BAD_REQUEST, "Expected a multipart/form-data body");
        }
    };

    let image = match read_image_from_multipart(multipart, state.config.max_upload_bytes).await {
        Ok(image) => image,
        Err(error) => return upload_error_to_response(error),
    };

    let storage = match state.storage.as_ref() {
        Some(storage) => storage,
        None => return failure(StatusCode::SERVICE_UNAVAILABLE, "Storage is not configured"),
    };

    let path = format!("{}/{}.{}", user.user_id, Uuid::new_v4(), image.extension);
    let bucket = &state.config.storage_bucket;
    let size = image.bytes.len();

    if let Err(error) = storage
        .upload_object(bucket, &path, image.content_type, image.bytes)
        .await
    {
        tracing::error!(
            error = %error,
            user_id = %user.user_id,
            path = %path,
            "image upload failed"
        );
        return failure(StatusCode::BAD_GATEWAY, "Failed to store upload");
    }

    tracing::info!(
        user_id = %user.user_id,
        path = %path,
        size,
        original_name = %image.original_name,
        "image uploaded"
    );

    success(json!({
        "url": storage.public_object_url(bucket, &path),
        "path": path,
    }))
}

fn upload_error_to_response(error: UploadError) -> Response {
    match error {
        UploadError::MissingFile
        | UploadError::UnsupportedFileType
        | UploadError::EmptyFile
        | UploadError::MultipartError => failure(StatusCode::BAD_REQUEST, error.to_string()),
        UploadError::FileTooLarge => {
            failure(StatusCode::PAYLOAD_TOO_LARGE, "File exceeds upload limit")
        }
    }
}
