use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::model::Capability;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to load backend: {0}")]
    BackendLoad(String),
    #[error("model not loaded")]
    BackendUnavailable,
    #[error("invalid image format: {0}")]
    InvalidImage(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("model does not support '{0}'")]
    UnsupportedCapability(Capability),
    #[error("model execution failed: {0}")]
    Invocation(String),
    #[error("model returned no usable '{key}' for '{capability}'")]
    MalformedResult {
        capability: Capability,
        key: &'static str,
    },
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::InvalidImage(_) | ServiceError::InvalidParameter(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::BackendLoad(_)
            | ServiceError::UnsupportedCapability(_)
            | ServiceError::Invocation(_)
            | ServiceError::MalformedResult { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::BackendLoad(_) => "backend_load",
            ServiceError::BackendUnavailable => "backend_unavailable",
            ServiceError::InvalidImage(_) => "invalid_image",
            ServiceError::InvalidParameter(_) => "invalid_parameter",
            ServiceError::UnsupportedCapability(_) => "unsupported_capability",
            ServiceError::Invocation(_) => "invocation_failure",
            ServiceError::MalformedResult { .. } => "malformed_result",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}
