//! Subscription management endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
};
use serde::Deserialize;

use super::{ActionResponse, ApiError, api_error, engine_error};
use crate::app::AppState;
use crate::db::{SubscriptionPatch, SubscriptionRecord, UpsertSubscription};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub enabled_only: bool,
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SubscriptionRecord>>, ApiError> {
    state
        .db
        .subscriptions()
        .list(query.enabled_only)
        .await
        .map(Json)
        .map_err(engine_error)
}

/// Create a subscription or update an existing one
async fn upsert_subscription(
    State(state): State<AppState>,
    Json(body): Json<UpsertSubscription>,
) -> Result<(StatusCode, Json<SubscriptionRecord>), ApiError> {
    if body.source_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "source_id must not be empty"));
    }

    let record = state
        .db
        .subscriptions()
        .upsert(body)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Toggle `enabled` or `auto_download` without touching the rest of the record
async fn update_subscription(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Json(patch): Json<SubscriptionPatch>,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    state
        .db
        .subscriptions()
        .update(&source_id, &patch)
        .await
        .map_err(engine_error)?
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("Subscription {source_id} not found"),
            )
        })
}

/// Remove a subscription; its progress is purged at the start of the next run
async fn remove_subscription(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let removed = state
        .db
        .subscriptions()
        .remove(&source_id)
        .await
        .map_err(engine_error)?;

    if removed {
        Ok(ActionResponse::ok(format!("Subscription {source_id} removed")))
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Subscription {source_id} not found"),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/subscriptions",
            get(list_subscriptions).post(upsert_subscription),
        )
        .route(
            "/subscriptions/{source_id}",
            patch(update_subscription).delete(remove_subscription),
        )
}
