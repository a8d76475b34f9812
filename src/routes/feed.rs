use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    error::{AppError, AppResult},
    models::FeedFilter,
    routes::{validate_amount, validate_username},
    services::{
        keys::{verify_activity_key, ActivityPrivateKey},
        ledger::anonymous_user_id,
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct FeedRequest {
    pub username: String,
    pub user_id: String,
    pub proof: String,
    pub private_activity_key: String,
    #[serde(default = "default_amount")]
    pub amount: usize,
    #[serde(default)]
    pub filter: FeedFilter,
}

fn default_amount() -> usize {
    25
}

/// Handler for the personalized feed
pub async fn build(
    State(state): State<AppState>,
    Json(request): Json<FeedRequest>,
) -> AppResult<Json<Value>> {
    validate_username(&request.username)?;
    let amount = validate_amount(request.amount)?;

    state
        .accounts
        .verify_device(&request.username, &request.proof, None)
        .await?;
    let info = state
        .accounts
        .activity_identity(&request.username, &request.user_id)
        .await?;

    if !verify_activity_key(&request.private_activity_key, &info.public_activity_key) {
        return Err(AppError::Auth("activity key mismatch".to_string()));
    }
    let key = ActivityPrivateKey::from_pem(&request.private_activity_key)
        .ok_or_else(|| AppError::Auth("unparseable activity key".to_string()))?;

    let anonymous_id = anonymous_user_id(
        &request.username,
        &info.public_activity_key,
        &request.user_id,
    );
    let posts = state
        .feed
        .build_feed(
            &request.username,
            &anonymous_id,
            &key,
            amount,
            &request.filter,
        )
        .await?;
    info!(username = %request.username, posts = posts.len(), "feed assembled");

    Ok(Json(json!({ "status": "ok", "posts": posts })))
}
