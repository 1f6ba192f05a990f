use attendance_core::OutcomeKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayError;

/// Operator-facing detail attached to recognition failures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub exit_code: Option<i32>,
    pub command: String,
    pub script_path: String,
    pub output: String,
    pub error: String,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image file provided")]
    MissingImage,

    #[error("Only image files (JPG/PNG) are allowed: {0}")]
    InvalidImage(String),

    #[error("Failed to save uploaded image")]
    ImageSave(#[source] std::io::Error),

    #[error("The recognition service is busy. Please try again shortly.")]
    Busy,

    #[error("{}", .kind.message())]
    Recognition {
        kind: OutcomeKind,
        debug: Option<Box<DebugInfo>>,
    },

    #[error("Operator endpoints are disabled")]
    DebugDisabled,

    /// `detail` reaches the client only when `expose` is set.
    #[error("Internal server error")]
    Internal { detail: String, expose: bool },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DebugDisabled => StatusCode::FORBIDDEN,
            ApiError::ImageSave(_) | ApiError::Recognition { .. } | ApiError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code for the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MissingImage => "missing_image",
            ApiError::InvalidImage(_) => "invalid_image",
            ApiError::ImageSave(_) => "image_save_error",
            ApiError::Busy => "busy",
            ApiError::Recognition { kind, .. } => kind.code(),
            ApiError::DebugDisabled => "forbidden",
            ApiError::Internal { .. } => "internal_error",
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::InvalidImage(e) => ApiError::InvalidImage(e.to_string()),
            RelayError::Admission(_) => ApiError::Busy,
            RelayError::ImageSave(e) => ApiError::ImageSave(e),
        }
    }
}

#[derive(Serialize)]
struct FailureBody {
    success: bool,
    message: String,
    error: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<Box<DebugInfo>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal { detail, .. } = &self {
            tracing::error!(detail = %detail, "internal error");
        }
        if status.is_server_error() {
            tracing::warn!(error = self.code(), message = %self, "request failed");
        } else {
            tracing::debug!(error = self.code(), "request rejected");
        }

        let instructions = match &self {
            ApiError::MissingImage => Some("Please capture an image using the camera and try again"),
            _ => None,
        };
        let message = self.to_string();
        let error = self.code();
        let (detail, debug) = match self {
            ApiError::Recognition { debug, .. } => (None, debug),
            ApiError::Internal { detail, expose } => (expose.then_some(detail), None),
            _ => (None, None),
        };
        let body = FailureBody {
            success: false,
            message,
            error,
            status: "absent",
            instructions,
            detail,
            debug,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingImage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidImage("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        for kind in OutcomeKind::ALL {
            let e = ApiError::Recognition { kind, debug: None };
            assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(e.code(), kind.code());
        }
    }

    async fn body_of(e: ApiError) -> serde_json::Value {
        let resp = e.into_response();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_internal_detail_only_when_exposed() {
        let internal = |expose| ApiError::Internal {
            detail: "database is locked".into(),
            expose,
        };

        let body = body_of(internal(true)).await;
        assert_eq!(body["error"], "internal_error");
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["detail"], "database is locked");

        let body = body_of(internal(false)).await;
        assert_eq!(body["error"], "internal_error");
        assert!(body.get("detail").is_none());
    }
}
