use axum::extract::Multipart;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub extension: &'static str,
    pub original_name: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File not found")]
    MissingFile,
    #[error("Only PNG, JPEG and WEBP images are supported")]
    UnsupportedFileType,
    #[error("File is too large")]
    FileTooLarge,
    #[error("File is empty")]
    EmptyFile,
    #[error("Failed to parse upload")]
    MultipartError,
}

const IMAGE_TYPES: &[(&str, &str, &[&str])] = &[
    ("image/png", "png", &["png"]),
    ("image/jpeg", "jpg", &["jpg", "jpeg"]),
    ("image/webp", "webp", &["webp"]),
];

/// Resolves the stored content type from the declared type, then the extension.
fn image_type(
    content_type: Option<&str>,
    file_name: &str,
) -> Option<(&'static str, &'static str)> {
    let declared = content_type
        .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());
    if let Some(declared) = declared.as_deref() {
        let declared = if declared == "image/jpg" { "image/jpeg" } else { declared };
        if let Some((mime, ext, _)) = IMAGE_TYPES.iter().find(|(mime, _, _)| *mime == declared) {
            return Some((*mime, *ext));
        }
    }

    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    IMAGE_TYPES
        .iter()
        .find(|(_, _, extensions)| extensions.contains(&extension.as_str()))
        .map(|(mime, ext, _)| (*mime, *ext))
}

pub async fn read_image_from_multipart(
    mut multipart: Multipart,
    max_size_bytes: usize,
) -> Result<UploadedImage, UploadError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| UploadError::MultipartError)?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field
            .file_name()
            .map(ToString::to_string)
            .unwrap_or_else(|| "image".to_string());
        let (content_type, extension) = image_type(field.content_type(), &original_name)
            .ok_or(UploadError::UnsupportedFileType)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| UploadError::MultipartError)?
        {
            if buffer.len() + chunk.len() > max_size_bytes {
                return Err(UploadError::FileTooLarge);
            }
            buffer.extend_from_slice(&chunk);
        }

        if buffer.is_empty() {
            return Err(UploadError::EmptyFile);
        }

        return Ok(UploadedImage {
            bytes: buffer.freeze(),
            content_type,
            extension,
            original_name,
        });
    }

    Err(UploadError::MissingFile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_type_from_content_type_or_extension() {
        assert_eq!(image_type(Some("image/png"), "x"), Some(("image/png", "png")));
        assert_eq!(image_type(Some("image/jpg"), "x"), Some(("image/jpeg", "jpg")));
        assert_eq!(
            image_type(Some("application/octet-stream"), "photo.JPEG"),
            Some(("image/jpeg", "jpg"))
        );
        assert_eq!(image_type(None, "a.webp"), Some(("image/webp", "webp")));
        assert_eq!(image_type(Some("application/pdf"), "doc.pdf"), None);
        assert_eq!(image_type(None, "noext"), None);
    }
}
