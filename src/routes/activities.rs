use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::info;

use crate::{
    error::{AppError, AppResult},
    models::{ActivityType, PostId},
    routes::{validate_amount, validate_username},
    services::{
        keys::{verify_activity_key, ActivityPrivateKey},
        ledger::anonymous_user_id,
    },
    state::AppState,
};

/// Records considered when viewing scored activity.
const VIEW_ACTIVITY_LIMIT: i64 = 250;

#[derive(Debug, Deserialize)]
pub struct AddActivityRequest {
    pub username: String,
    pub user_id: String,
    pub proof: String,
    pub activity_type: String,
    pub metadata: Map<String, Value>,
}

/// Handler for recording one activity event
///
/// Duplicates inside the dedup window still answer `ok`; the client has
/// no use for the distinction and retries would only re-send the event.
pub async fn add(
    State(state): State<AppState>,
    Json(request): Json<AddActivityRequest>,
) -> AppResult<Json<Value>> {
    validate_username(&request.username)?;
    let activity = ActivityType::parse(&request.activity_type).ok_or_else(|| {
        AppError::Validation(format!("unknown activity type: {}", request.activity_type))
    })?;

    state
        .accounts
        .verify_device(&request.username, &request.proof, None)
        .await?;
    let info = state
        .accounts
        .activity_identity(&request.username, &request.user_id)
        .await?;

    let created = state
        .ledger
        .record(
            activity,
            &request.username,
            &request.user_id,
            &info.public_activity_key,
            &request.metadata,
        )
        .await?;
    info!(username = %request.username, %activity, created, "activity recorded");

    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct ViewActivityQuery {
    pub username: String,
    pub proof: String,
    #[serde(default = "default_amount")]
    pub amount: usize,
}

fn default_amount() -> usize {
    25
}

#[derive(Debug, Deserialize)]
pub struct ViewActivityRequest {
    pub user_id: String,
    pub private_activity_key: String,
    /// Defaults to scroll events, the densest signal.
    pub activity_type: Option<String>,
}

/// Handler for viewing one's own scored activity
///
/// Scores are reported as percentages of the 4.0 scale so the client
/// does not depend on the scoring internals.
pub async fn view(
    State(state): State<AppState>,
    Query(query): Query<ViewActivityQuery>,
    Json(request): Json<ViewActivityRequest>,
) -> AppResult<Json<Value>> {
    validate_username(&query.username)?;
    let amount = validate_amount(query.amount)?;
    let activity = match &request.activity_type {
        Some(raw) => ActivityType::parse(raw)
            .ok_or_else(|| AppError::Validation(format!("unknown activity type: {raw}")))?,
        None => ActivityType::PostScrolled,
    };

    state
        .accounts
        .verify_device(&query.username, &query.proof, None)
        .await?;
    let info = state
        .accounts
        .activity_identity(&query.username, &request.user_id)
        .await?;

    if !verify_activity_key(&request.private_activity_key, &info.public_activity_key) {
        return Err(AppError::Auth("activity key mismatch".to_string()));
    }
    let key = ActivityPrivateKey::from_pem(&request.private_activity_key)
        .ok_or_else(|| AppError::Auth("unparseable activity key".to_string()))?;

    let anonymous_id = anonymous_user_id(
        &query.username,
        &info.public_activity_key,
        &request.user_id,
    );
    let mut scored = state
        .ledger
        .read_scored(
            activity,
            &query.username,
            &anonymous_id,
            &key,
            VIEW_ACTIVITY_LIMIT,
            amount,
            false,
        )
        .await?;

    scored
        .posts
        .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.posts.truncate(amount);

    let scores: HashMap<PostId, f64> = scored.posts.iter().cloned().collect();
    let ids: Vec<PostId> = scored.posts.iter().map(|(id, _)| id.clone()).collect();
    let resolved = state.search.resolve_posts(&ids).await?;

    let activities: Vec<Value> = resolved
        .into_iter()
        .map(|post| {
            let id = PostId::new(&post.author, &post.permlink);
            let score = scores.get(&id).copied().unwrap_or_default();
            json!({
                "author": post.author,
                "permlink": post.permlink,
                "score_percent": score / 4.0 * 100.0,
            })
        })
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "user_avg": scored.personal_average,
        "activities": activities,
    })))
}
