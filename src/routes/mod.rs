use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::{AppError, AppResult},
    middleware::request_id::{make_span_with_request_id, request_id_middleware},
    state::AppState,
};

pub mod accounts;
pub mod activities;
pub mod feed;

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/accounts/session-id", get(accounts::session_id))
        .route("/accounts/register-device", get(accounts::register_device))
        .route("/accounts/verify-device", get(accounts::verify_device))
        .route("/activities/add", post(activities::add))
        .route("/activities/view", post(activities::view))
        .route("/feed", post(feed::build))
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Chain account names: 3 to 16 characters of lowercase letters, digits,
/// dots and dashes.
pub(crate) fn validate_username(username: &str) -> AppResult<()> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !(3..=16).contains(&username.len()) || !valid_chars {
        return Err(AppError::Validation("invalid username".to_string()));
    }
    Ok(())
}

/// Feed/view page sizes.
pub(crate) fn validate_amount(amount: usize) -> AppResult<usize> {
    if !(1..=100).contains(&amount) {
        return Err(AppError::Validation(
            "amount must be between 1 and 100".to_string(),
        ));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a-b.c1").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("user name").is_err());
        assert!(validate_username("averyverylongusername").is_err());
    }

    #[test]
    fn test_amount_validation() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(100).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(101).is_err());
    }
}
