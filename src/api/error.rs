//! HTTP error mapping.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::staff::StaffError;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}

/// Errors returned by the HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    Staff(StaffError),
    /// Request body could not be read as the expected JSON.
    InvalidBody(String),
}

impl From<StaffError> for ApiError {
    fn from(e: StaffError) -> Self {
        ApiError::Staff(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::InvalidBody(reason) => {
                (StatusCode::BAD_REQUEST, format!("Validation error: {}", reason))
            }
            ApiError::Staff(e) => match e {
                StaffError::Validation(_) | StaffError::BadRequest(_) => {
                    (StatusCode::BAD_REQUEST, e.to_string())
                }
                StaffError::NotFound => (StatusCode::NOT_FOUND, e.to_string()),
                StaffError::Conflict(_) => (StatusCode::CONFLICT, e.to_string()),
                StaffError::EventPublish(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            if let ApiError::Staff(e) = &self {
                error!(error = %e, "Request failed");
            }
        }
        (status, Json(ErrorBody::new(message))).into_response()
    }
}
