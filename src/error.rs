use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Token rejected by PagerDuty (401/403). Not retried by the poller.
    #[error("PagerDuty authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout, rate limit or upstream 5xx.
    #[error("PagerDuty request failed: {0}")]
    TransientFetch(String),

    /// Response body decoded but is missing fields we rely on.
    #[error("Unexpected PagerDuty response shape: {0}")]
    UnexpectedShape(String),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("External service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a failed cycle should simply be retried on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientFetch(_)
                | AppError::UnexpectedShape(_)
                | AppError::Request(_)
                | AppError::ServiceUnavailable(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Auth(_))
    }

    /// Short machine-readable code, shared by logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::TransientFetch(_) => "TRANSIENT_FETCH_ERROR",
            AppError::UnexpectedShape(_) => "UNEXPECTED_SHAPE",
            AppError::Request(_) => "EXTERNAL_REQUEST_FAILED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Auth(msg) => {
                tracing::error!("PagerDuty authentication error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "PagerDuty rejected the configured API token".to_string(),
                )
            }
            AppError::TransientFetch(msg) => {
                tracing::warn!("PagerDuty fetch error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::UnexpectedShape(msg) => {
                tracing::error!("Unexpected PagerDuty response: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to communicate with PagerDuty".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
