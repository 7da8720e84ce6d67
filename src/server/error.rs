use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::service::ServiceError;

/// Handler error, rendered as `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    BadRequest(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Service(e) => match e {
                ServiceError::NotFound { .. } | ServiceError::InvalidHandle(_) => StatusCode::NOT_FOUND,
                ServiceError::InvalidArtifact { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                ServiceError::ContextLimit { .. } => StatusCode::CONFLICT,
                ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ServiceError::Engine(crate::inference::engine::EngineError::InvalidInput(_)) => {
                    StatusCode::BAD_REQUEST
                }
                ServiceError::LoadFailure(_) | ServiceError::Engine(_) | ServiceError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Service(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {e}"))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Service(e) => write!(f, "{e}"),
            ApiError::BadRequest(message) | ApiError::Internal(message) => f.write_str(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), "{self}");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
