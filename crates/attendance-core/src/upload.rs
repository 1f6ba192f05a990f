//! Upload validation.
//!
//! An upload must pass every check here before it is written to disk or
//! handed to the recognition process.

use image::ImageFormat;
use std::path::Path;
use thiserror::Error;

/// Largest accepted image, in bytes (10 MiB).
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_MIME: [&str; 2] = ["image/jpeg", "image/png"];
const ALLOWED_EXT: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UploadError {
    #[error("image is empty")]
    Empty,
    #[error("image is {size} bytes; limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("content type {0:?} is not allowed; only JPG/PNG images are accepted")]
    UnsupportedType(String),
    #[error("file extension {0:?} is not allowed; only JPG/PNG images are accepted")]
    UnsupportedExtension(String),
    #[error("file content is not a JPEG or PNG image")]
    UnrecognizedContent,
}

/// Image encodings the relay accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    /// Extension used for the on-disk copy.
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
        }
    }
}

/// Check size, declared type, file extension and magic bytes.
///
/// Returns the encoding detected from the content itself, which decides the
/// extension of the persisted file.
pub fn validate_upload(
    file_name: Option<&str>,
    content_type: Option<&str>,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<ImageKind, UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_MIME.contains(&mime.as_str()) {
        return Err(UploadError::UnsupportedType(mime));
    }

    let ext = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_EXT.contains(&ext.as_str()) {
        return Err(UploadError::UnsupportedExtension(ext));
    }

    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => Ok(ImageKind::Jpeg),
        Ok(ImageFormat::Png) => Ok(ImageKind::Png),
        _ => Err(UploadError::UnrecognizedContent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn test_accepts_jpeg_and_png() {
        assert_eq!(
            validate_upload(Some("me.JPG"), Some("image/jpeg"), JPEG_MAGIC, MAX_UPLOAD_BYTES),
            Ok(ImageKind::Jpeg)
        );
        assert_eq!(
            validate_upload(Some("me.png"), Some("image/png"), PNG_MAGIC, MAX_UPLOAD_BYTES),
            Ok(ImageKind::Png)
        );
    }

    #[test]
    fn test_rejects_wrong_mime() {
        let err = validate_upload(Some("me.jpg"), Some("image/gif"), JPEG_MAGIC, MAX_UPLOAD_BYTES);
        assert_eq!(err, Err(UploadError::UnsupportedType("image/gif".into())));
        let err = validate_upload(Some("me.jpg"), None, JPEG_MAGIC, MAX_UPLOAD_BYTES);
        assert!(matches!(err, Err(UploadError::UnsupportedType(_))));
    }

    #[test]
    fn test_rejects_wrong_extension() {
        let err = validate_upload(Some("me.gif"), Some("image/jpeg"), JPEG_MAGIC, MAX_UPLOAD_BYTES);
        assert_eq!(err, Err(UploadError::UnsupportedExtension("gif".into())));
        let err = validate_upload(None, Some("image/jpeg"), JPEG_MAGIC, MAX_UPLOAD_BYTES);
        assert_eq!(err, Err(UploadError::UnsupportedExtension(String::new())));
    }

    #[test]
    fn test_rejects_mislabelled_content() {
        let err = validate_upload(Some("me.jpg"), Some("image/jpeg"), b"GIF89a....", MAX_UPLOAD_BYTES);
        assert_eq!(err, Err(UploadError::UnrecognizedContent));
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(
            validate_upload(Some("me.jpg"), Some("image/jpeg"), &[], MAX_UPLOAD_BYTES),
            Err(UploadError::Empty)
        );
        assert_eq!(
            validate_upload(Some("me.jpg"), Some("image/jpeg"), JPEG_MAGIC, 4),
            Err(UploadError::TooLarge { size: JPEG_MAGIC.len(), limit: 4 })
        );
    }
}
