use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    routes::validate_username,
    services::keys::{random_hex, sha256_hex},
    state::AppState,
};

/// Verify-device proofs must have been issued within this window.
const PROOF_FRESHNESS_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct SessionIdQuery {
    pub username: String,
}

/// Handler for session id generation
///
/// Stateless: the id is never stored server-side, it only gives the
/// client a collision-safe identifier to correlate its own requests.
pub async fn session_id(Query(query): Query<SessionIdQuery>) -> AppResult<Json<Value>> {
    validate_username(&query.username)?;
    let session_id = sha256_hex(&format!("{}{}", query.username, random_hex(64)));
    Ok(Json(json!({ "status": "ok", "session_id": session_id })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceQuery {
    pub username: String,
    pub device_name: Option<String>,
}

/// Handler for device registration
pub async fn register_device(
    State(state): State<AppState>,
    Query(query): Query<RegisterDeviceQuery>,
) -> AppResult<Json<Value>> {
    validate_username(&query.username)?;

    let registration = state
        .accounts
        .register_device(&query.username, query.device_name)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "encoded_message": registration.proof_memo,
        "activity_info": registration.activity_info,
    })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyDeviceQuery {
    pub username: String,
    pub proof: String,
    pub user_id: String,
}

/// Handler for device verification
///
/// Unlike the activity routes, verification demands a fresh proof: the
/// client is expected to re-seal it right before calling.
pub async fn verify_device(
    State(state): State<AppState>,
    Query(query): Query<VerifyDeviceQuery>,
) -> AppResult<Json<Value>> {
    validate_username(&query.username)?;

    let device = state
        .accounts
        .verify_device(
            &query.username,
            &query.proof,
            Some(Duration::seconds(PROOF_FRESHNESS_SECS)),
        )
        .await?;
    let info = state
        .accounts
        .activity_identity(&query.username, &query.user_id)
        .await?;

    if info.memo_key != device.memo_key {
        return Err(AppError::Auth(
            "device does not match account memo key".to_string(),
        ));
    }

    Ok(Json(json!({ "status": "ok" })))
}
