use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::error::UploadError;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::ObjectNotUploading { .. }
            | UploadError::DuplicateName(_)
            | UploadError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            UploadError::InvalidChunkIndex { .. } | UploadError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::ChunkMissing(_)
            | UploadError::PathTaken(_)
            | UploadError::PrematureAssembly { .. }
            | UploadError::MergeWriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Sqlx(err) => {
                tracing::error!("metadata store error: {err}");
                return AppError::internal("metadata store error");
            }
        };
        AppError::new(status, err.to_string())
    }
}
