use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-level errors
///
/// Everything here is request-scoped; nothing is fatal to the process.
/// Per-record decode failures never reach this type — they are dropped at
/// the decryption gateway.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::RateLimited(msg) | AppError::QuotaExceeded(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, msg)
            }
            AppError::Dependency(msg) => (StatusCode::BAD_GATEWAY, msg),
            // The document store is an upstream dependency like the search
            // backend, so its failures surface the same way.
            AppError::Database(_) | AppError::HttpClient(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Cache(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "status": "failed",
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
