use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::db::{EventRepository, FeedRepository};
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::fetcher::SyncMode;
use crate::services::rematch::{self, RematchRequest};
use crate::services::sync::{CalendarSyncManager, SyncOptions};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync", post(sync_feed))
        .route("/rematch", post(rematch_events))
        .route("/feeds/:id/status", get(feed_status))
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub feed_id: String,
    #[serde(default)]
    pub mode: SyncMode,
    pub window_days: Option<u32>,
}

/// Sync one of the caller's feeds now.
async fn sync_feed(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SyncRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let feed = FeedRepository::find_for_user(&state.db, &request.feed_id, &user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Calendar feed {} not found", request.feed_id)))?;

    let report = CalendarSyncManager::sync_feed(
        &state,
        &feed,
        SyncOptions {
            mode: request.mode,
            window_days: request.window_days,
        },
    )
    .await?;

    Ok(Json(json!({
        "success": true,
        "count": report.count,
        "type": report.source_kind,
        "calendar_name": report.calendar_name,
        "inserted": report.outcome.inserted,
        "updated": report.outcome.updated,
        "unchanged": report.outcome.unchanged,
        "deleted": report.outcome.deleted,
    })))
}

/// Re-apply the caller's current tag and studio rules to stored events.
async fn rematch_events(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<RematchRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if request.user_id != user_id {
        return Err(AppError::Forbidden);
    }

    let outcome = rematch::rematch(&state.db, &request, state.config.sync.rematch_max_batch_size).await?;

    Ok(Json(json!({
        "success": true,
        "total_events_processed": outcome.total_events_processed,
        "updated_count": outcome.updated_count,
        "message": format!(
            "Rematched {} events, updated {}",
            outcome.total_events_processed, outcome.updated_count
        ),
    })))
}

async fn feed_status(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(feed_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let feed = FeedRepository::find_for_user(&state.db, &feed_id, &user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Calendar feed {} not found", feed_id)))?;
    let events_count = EventRepository::count_for_feed(&state.db, &feed.id).await?;

    let last_synced_at = feed
        .last_synced_at
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339());

    Ok(Json(json!({
        "feed_id": feed.id,
        "last_synced_at": last_synced_at,
        "events_count": events_count,
    })))
}
