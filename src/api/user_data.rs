// src/api/user_data.rs
// Privacy surface: export everything we hold for a user, delete all of it,
// or forget just the recent window. Deletion responses carry per-store
// booleans so callers can distinguish partial success.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use qdrant_client::qdrant::Filter;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, OrInternal};
use crate::state::AppState;
use crate::vector::{match_field, MEMORY_COLLECTION};

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub limit: Option<i64>,
}

/// DELETE /user/{user_id}/data
pub async fn delete_all_user_data(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let uid = if user_id.trim().is_empty() { "anon" } else { user_id.trim() };

    let pg_chat = sqlx::query("DELETE FROM chat_log WHERE user_id=$1")
        .bind(uid)
        .execute(&app.pool)
        .await
        .or_internal("pg_delete_failed")?
        .rows_affected();
    let pg_threads = sqlx::query("DELETE FROM threads WHERE user_id=$1")
        .bind(uid)
        .execute(&app.pool)
        .await
        .or_internal("pg_delete_failed")?
        .rows_affected();

    let filter = Filter::must([match_field("user_id", uid)]);
    let qdrant_deleted = match app.vector.delete_by_filter(MEMORY_COLLECTION, filter).await {
        Ok(()) => true,
        Err(e) => {
            warn!(user_id = %uid, "qdrant delete failed: {}", e);
            false
        }
    };

    Ok(Json(json!({
        "status": "ok",
        "user_id": uid,
        "pg_chat_log": pg_chat,
        "pg_threads": pg_threads,
        "qdrant_deleted": qdrant_deleted,
    })))
}

/// DELETE /user/{user_id}/recent?minutes=60
pub async fn delete_recent_user_data(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<RecentQuery>,
) -> ApiResult<Json<JsonValue>> {
    let uid = if user_id.trim().is_empty() { "anon" } else { user_id.trim() };
    let minutes = q.minutes.unwrap_or(60);
    if minutes < 1 {
        return Err(ApiError::bad_request("minutes must be >= 1"));
    }
    if minutes > 60 * 24 * 30 {
        return Err(ApiError::bad_request("minutes too large"));
    }

    let cutoff = Utc::now() - Duration::minutes(minutes);

    // Gather ids first: chat_log row ids double as Qdrant point ids.
    let rows = sqlx::query("SELECT id FROM chat_log WHERE user_id=$1 AND created_at >= $2")
        .bind(uid)
        .bind(cutoff)
        .fetch_all(&app.pool)
        .await
        .or_internal("pg_delete_failed")?;
    let ids: Vec<String> = rows.iter().map(|r| r.get::<Uuid, _>("id").to_string()).collect();

    let pg_deleted = sqlx::query("DELETE FROM chat_log WHERE user_id=$1 AND created_at >= $2")
        .bind(uid)
        .bind(cutoff)
        .execute(&app.pool)
        .await
        .or_internal("pg_delete_failed")?
        .rows_affected();

    let mut qdrant_deleted = 0usize;
    for batch in ids.chunks(256) {
        match app.vector.delete_points(MEMORY_COLLECTION, batch).await {
            Ok(()) => qdrant_deleted += batch.len(),
            Err(e) => {
                warn!(user_id = %uid, "recent qdrant delete failed: {}", e);
                break;
            }
        }
    }

    Ok(Json(json!({
        "status": "ok",
        "user_id": uid,
        "minutes": minutes,
        "pg_deleted": pg_deleted,
        "qdrant_deleted_points": qdrant_deleted,
    })))
}

/// GET /user/{user_id}/export
pub async fn export_user_data(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<ExportQuery>,
) -> ApiResult<Json<JsonValue>> {
    let uid = if user_id.trim().is_empty() { "anon" } else { user_id.trim() };
    let limit = q.limit.unwrap_or(20_000);
    if limit < 1 {
        return Err(ApiError::bad_request("limit must be >= 1"));
    }
    if limit > 200_000 {
        return Err(ApiError::bad_request("limit too large"));
    }

    let threads = sqlx::query(
        "SELECT id, title, created_at, updated_at, archived
         FROM threads WHERE user_id=$1 ORDER BY updated_at DESC",
    )
    .bind(uid)
    .fetch_all(&app.pool)
    .await
    .or_internal("export failed")?;

    let messages = sqlx::query(
        "SELECT id, thread_id, source, text, tags, created_at
         FROM chat_log WHERE user_id=$1 ORDER BY created_at ASC LIMIT $2",
    )
    .bind(uid)
    .bind(limit)
    .fetch_all(&app.pool)
    .await
    .or_internal("export failed")?;

    let thread_items: Vec<JsonValue> = threads
        .iter()
        .map(|r| {
            json!({
                "id": r.get::<Uuid, _>("id").to_string(),
                "title": r.get::<String, _>("title"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at").to_rfc3339(),
                "updated_at": r.get::<DateTime<Utc>, _>("updated_at").to_rfc3339(),
                "archived": r.get::<bool, _>("archived"),
            })
        })
        .collect();

    let message_items: Vec<JsonValue> = messages
        .iter()
        .map(|r| {
            json!({
                "id": r.get::<Uuid, _>("id").to_string(),
                "thread_id": r.get::<Option<Uuid>, _>("thread_id").map(|t| t.to_string()),
                "source": r.get::<Option<String>, _>("source"),
                "text": r.get::<Option<String>, _>("text"),
                "tags": r.get::<Option<Vec<String>>, _>("tags").unwrap_or_default(),
                "created_at": r.get::<DateTime<Utc>, _>("created_at").to_rfc3339(),
            })
        })
        .collect();

    // Latest cards from the vector store (best-effort).
    let filter = Filter::must([
        match_field("user_id", uid),
        match_field("source", "memory_card"),
    ]);
    let cards: Vec<JsonValue> = match app
        .vector
        .scroll(MEMORY_COLLECTION, Some(filter), 256, true)
        .await
    {
        Ok(points) => points
            .into_iter()
            .map(|p| json!({"id": p.id, "payload": p.payload}))
            .collect(),
        Err(e) => {
            warn!(user_id = %uid, "card export skipped: {}", e);
            Vec::new()
        }
    };

    Ok(Json(json!({
        "status": "ok",
        "user_id": uid,
        "threads": thread_items,
        "messages": message_items,
        "cards": cards,
    })))
}
