use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("Failed to start stream on {device}: {reason}")]
    StreamStartFailed { device: String, reason: String },

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Transient read failure: {0}")]
    TransientRead(String),

    #[error("Reconnect exhausted for {device} after {attempts} attempts")]
    ReconnectExhausted { device: String, attempts: u32 },

    #[error("Failed to spawn pipeline {index}: {reason}")]
    ProcessSpawnFailed { index: usize, reason: String },

    #[error("Pipeline {0} is already running")]
    AlreadyRunning(usize),

    #[error("Pipeline {0} is not running")]
    NotRunning(usize),

    #[error("Camera {0} not found")]
    SlotNotFound(usize),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SlotNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyRunning(_) | AppError::NotRunning(_) | AppError::DeviceBusy(_) => {
                StatusCode::CONFLICT
            }
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_message = %body.message,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_message = %body.message,
                "Request rejected"
            );
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
