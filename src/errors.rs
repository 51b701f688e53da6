use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::engine::ClassifyError;
use crate::types::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No `file` field in the request, or the request was not multipart at all
    #[error("No file uploaded. Send the image in the `file` field of a multipart/form-data request")]
    MissingFile,

    /// Declared media type is not one of the supported image formats
    #[error("Unsupported image format. Supported formats: .jpg, .jpeg, .png, .bmp, .tiff, .webp")]
    UnsupportedFormat { declared: Option<String> },

    /// Upload exceeded the configured size limit
    #[error("File too large. Maximum allowed size is {limit} bytes")]
    FileTooLarge { limit: usize },

    /// Bytes could not be read or decoded as an image
    #[error("Uploaded file is not a valid image")]
    InvalidImage { reason: String },

    /// The image decoded but contains no detectable face
    #[error("No face detected in the image")]
    NoFaceDetected,

    /// Anything unexpected; the cause is logged, never returned
    #[error("Internal error during emotion analysis")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingFile
            | ApiError::UnsupportedFormat { .. }
            | ApiError::FileTooLarge { .. }
            | ApiError::InvalidImage { .. }
            | ApiError::NoFaceDetected => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable kind, also used as the metrics outcome label.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MissingFile => "missing_file",
            ApiError::UnsupportedFormat { .. } => "unsupported_format",
            ApiError::FileTooLarge { .. } => "file_too_large",
            ApiError::InvalidImage { .. } => "invalid_image",
            ApiError::NoFaceDetected => "no_face_detected",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::NoFace => ApiError::NoFaceDetected,
            ClassifyError::Failed(source) => ApiError::Internal(source),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal(source) => {
                tracing::error!("Internal error during emotion analysis: {:#}", source);
            }
            ApiError::UnsupportedFormat { declared } => {
                tracing::warn!(declared = ?declared, "Unsupported image format");
            }
            ApiError::InvalidImage { reason } => {
                tracing::warn!(%reason, "Invalid image data");
            }
            ApiError::NoFaceDetected => {
                tracing::warn!("No face detected in the image");
            }
            ApiError::MissingFile | ApiError::FileTooLarge { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
