// src/api/threads.rs
// Thread CRUD over the transcript store. Deleting a thread also removes its
// vector points (best-effort; Postgres is authoritative).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use qdrant_client::qdrant::Filter;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, OrInternal};
use crate::identity::resolve_canonical_user_id;
use crate::state::AppState;
use crate::vector::{match_field, MEMORY_COLLECTION};

#[derive(Debug, Deserialize)]
pub struct NewThreadRequest {
    pub user_id: Option<String>,
    pub title: Option<String>,
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameThreadRequest {
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
}

/// POST /threads/new
pub async fn threads_new(
    State(app): State<Arc<AppState>>,
    Json(body): Json<NewThreadRequest>,
) -> ApiResult<Json<JsonValue>> {
    let alias = body.user_id.unwrap_or_default();
    let alias = if alias.trim().is_empty() { "anon" } else { alias.trim() };
    let title = body
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New chat".to_string());
    let vantage_id = body.vantage_id.unwrap_or_else(|| "default".to_string());

    let (user_id, _) = resolve_canonical_user_id(&app.pool, &vantage_id, alias).await;

    let row = sqlx::query(
        "INSERT INTO threads(user_id, title) VALUES ($1,$2) RETURNING id, title, updated_at",
    )
    .bind(&user_id)
    .bind(&title)
    .fetch_one(&app.pool)
    .await
    .or_internal("Failed to create thread")?;

    Ok(Json(json!({
        "thread_id": row.get::<Uuid, _>("id").to_string(),
        "title": row.get::<String, _>("title"),
        "updated_at": row.get::<DateTime<Utc>, _>("updated_at").to_rfc3339(),
    })))
}

/// GET /threads/list/{user_id}
pub async fn threads_list(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<JsonValue>> {
    let vantage_id = q.vantage_id.unwrap_or_else(|| "default".to_string());
    let (user_id, _) = resolve_canonical_user_id(&app.pool, &vantage_id, &user_id).await;

    let rows = sqlx::query(
        "SELECT id, title, updated_at FROM threads
         WHERE user_id=$1 AND archived=false
         ORDER BY updated_at DESC",
    )
    .bind(&user_id)
    .fetch_all(&app.pool)
    .await
    .or_internal("Failed to list threads")?;

    let items: Vec<JsonValue> = rows
        .iter()
        .map(|r| {
            json!({
                "thread_id": r.get::<Uuid, _>("id").to_string(),
                "title": r.get::<String, _>("title"),
                "updated_at": r.get::<DateTime<Utc>, _>("updated_at").to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!(items)))
}

/// GET /threads/{thread_id}/messages
pub async fn threads_messages(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult<Json<JsonValue>> {
    let tid = Uuid::parse_str(thread_id.trim())
        .map_err(|_| ApiError::bad_request("invalid thread_id"))?;
    let limit = q.limit.unwrap_or(200).clamp(1, 2000);

    let rows = sqlx::query(
        "SELECT source, text, created_at FROM chat_log
         WHERE thread_id=$1 ORDER BY created_at ASC LIMIT $2",
    )
    .bind(tid)
    .bind(limit)
    .fetch_all(&app.pool)
    .await
    .or_internal("Failed to load transcript")?;

    let items: Vec<JsonValue> = rows
        .iter()
        .map(|r| {
            let src: String = r.get::<Option<String>, _>("source").unwrap_or_default();
            let role = if src.contains("assistant") { "assistant" } else { "user" };
            json!({
                "role": role,
                "content": r.get::<Option<String>, _>("text"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at").to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!(items)))
}

/// POST /threads/{thread_id}/rename
pub async fn threads_rename(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Json(body): Json<RenameThreadRequest>,
) -> ApiResult<Json<JsonValue>> {
    let tid = Uuid::parse_str(thread_id.trim())
        .map_err(|_| ApiError::bad_request("invalid thread_id"))?;
    let title = body
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New chat".to_string());

    sqlx::query("UPDATE threads SET title=$1, updated_at=now() WHERE id=$2")
        .bind(&title)
        .bind(tid)
        .execute(&app.pool)
        .await
        .or_internal("Failed to rename thread")?;

    Ok(Json(json!({"status": "ok", "thread_id": tid.to_string(), "title": title})))
}

/// POST /threads/{thread_id}/archive
pub async fn threads_archive(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let tid = Uuid::parse_str(thread_id.trim())
        .map_err(|_| ApiError::bad_request("invalid thread_id"))?;

    sqlx::query("UPDATE threads SET archived=true, updated_at=now() WHERE id=$1")
        .bind(tid)
        .execute(&app.pool)
        .await
        .or_internal("Failed to archive thread")?;

    Ok(Json(json!({"status": "ok", "thread_id": tid.to_string(), "archived": true})))
}

/// DELETE /threads/{thread_id}
pub async fn threads_delete(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let tid = Uuid::parse_str(thread_id.trim())
        .map_err(|_| ApiError::bad_request("invalid thread_id"))?;

    sqlx::query("DELETE FROM chat_log WHERE thread_id=$1")
        .bind(tid)
        .execute(&app.pool)
        .await
        .or_internal("Failed to delete transcript")?;
    sqlx::query("DELETE FROM threads WHERE id=$1")
        .bind(tid)
        .execute(&app.pool)
        .await
        .or_internal("Failed to delete thread")?;

    // Vector cleanup is best-effort.
    let filter = Filter::must([match_field("thread_id", &tid.to_string())]);
    if let Err(e) = app.vector.delete_by_filter(MEMORY_COLLECTION, filter).await {
        warn!("thread vector cleanup skipped: {}", e);
    }

    Ok(Json(json!({"status": "ok", "thread_id": tid.to_string(), "deleted": true})))
}
