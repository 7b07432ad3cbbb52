//! Error taxonomy shared by the API surface and the job records.
//!
//! Every error that crosses the HTTP boundary, and every error recorded on a
//! job, carries a stable [`ErrorKind`] next to its human-readable message.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::services::auth::AuthError;
use crate::services::converter::ConversionError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

/// Stable, machine-readable error category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    Validation,
    Storage,
    Conversion,
    Exhausted,
    Queue,
    Cancelled,
}

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Queue(QueueError),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(job_id) => AppError::NotFound(format!("task {job_id} not found")),
            other => AppError::Queue(other),
        }
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            AppError::Storage(_) => ErrorKind::Storage,
            AppError::Conversion(_) => ErrorKind::Conversion,
            AppError::Queue(_) => ErrorKind::Queue,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Storage => StatusCode::BAD_GATEWAY,
            ErrorKind::Conversion | ErrorKind::Exhausted => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Queue => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = %self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(kind = %self.kind(), error = %self, "Request rejected");
        }

        let body = ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
