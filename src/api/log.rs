// src/api/log.rs
// Transcript ingest: tag, persist to Postgres (authoritative), embed into
// memory_raw (best-effort).

use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::common::RequestId;
use crate::api::error::ApiResult;
use crate::identity::{resolve_canonical_user_id, singleton_card_id};
use crate::retrieval::tags::infer_extra_tags;
use crate::state::AppState;
use crate::vector::MEMORY_COLLECTION;

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub input: Option<String>,
    pub source: Option<String>,
    pub tags: Option<Vec<String>>,
    pub thread_id: Option<String>,
    pub vantage_id: Option<String>,
}

/// POST /log
pub async fn log_chat(
    State(app): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<LogRequest>,
) -> ApiResult<Json<JsonValue>> {
    let text = body
        .text
        .or(body.input)
        .unwrap_or_default();
    let user_id_alias = body
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "anon".to_string());
    let source = body.source.unwrap_or_else(|| "frontend".to_string());
    let vantage_id = body
        .vantage_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "default".to_string());
    let mut tags = body.tags.unwrap_or_default();

    // Canonicalize for ALL writes.
    let (user_id, _) = resolve_canonical_user_id(&app.pool, &vantage_id, &user_id_alias).await;

    let thread_id_req = body.thread_id.as_deref().and_then(|t| Uuid::parse_str(t.trim()).ok());

    if text.trim().is_empty() {
        return Ok(Json(json!({"status": "empty", "detail": "no text"})));
    }

    // Heuristic content tags, merged without duplicates.
    for extra in infer_extra_tags(&text, &source) {
        if !tags.contains(&extra) {
            tags.push(extra);
        }
    }

    // Identity logs write a user_identity singleton card instead of a
    // transcript row.
    if source == "frontend/identity" {
        if let Some(full_name) = text.strip_prefix("FULL_NAME:") {
            let full_name = full_name.trim();
            if full_name.is_empty() {
                return Ok(Json(json!({"status": "empty", "detail": "no full_name"})));
            }

            let created = Utc::now().to_rfc3339();
            let card_text = format!("The user's preferred name is {full_name}.");
            let payload = json!({
                "text": card_text,
                "user_id": user_id,
                "user_id_alias": user_id_alias,
                "source": "memory_card",
                "tags": ["summary", "card", "user_identity"],
                "kind": "user_identity",
                "topic_key": "__singleton__",
                "base_importance": 0.9,
                "created_at": created,
                "updated_at": created,
            });

            match app.embedder.embed(&card_text).await {
                Ok(vec) => {
                    let rec_id = singleton_card_id(&user_id, "user_identity", "__singleton__").to_string();
                    if let Err(e) = app.vector.upsert(MEMORY_COLLECTION, &rec_id, vec, &payload).await {
                        warn!("identity card upsert failed: {}", e);
                    }
                }
                Err(e) => warn!("identity card embed failed: {}", e),
            }

            return Ok(Json(json!({"status": "ok", "id": user_id, "note": "identity_card"})));
        }
    }

    // Stable id shared by the Postgres row and the Qdrant point.
    let rec_id = Uuid::new_v4();
    let created_dt = Utc::now();

    // 1) Postgres transcript (authoritative).
    let mut thread_id = thread_id_req;
    if let Some(tid) = thread_id {
        let owner: Option<(String,)> = sqlx::query_as("SELECT user_id FROM threads WHERE id=$1")
            .bind(tid)
            .fetch_optional(&app.pool)
            .await
            .unwrap_or(None);

        match owner {
            None => {
                // Create the thread with the provided id so the transcript
                // attaches.
                if let Err(e) = sqlx::query("INSERT INTO threads(id, user_id, title) VALUES($1, $2, $3)")
                    .bind(tid)
                    .bind(&user_id)
                    .bind("New chat")
                    .execute(&app.pool)
                    .await
                {
                    warn!("thread create failed: {}", e);
                    thread_id = None;
                }
            }
            Some((owner_id,)) if owner_id != user_id => {
                // Never attach messages to another user's thread. Self-heal
                // when the stored owner is an alias of this user.
                let (owner_canon, _) =
                    resolve_canonical_user_id(&app.pool, &vantage_id, &owner_id).await;
                if owner_canon == user_id {
                    sqlx::query("UPDATE threads SET user_id=$1, updated_at=now() WHERE id=$2")
                        .bind(&user_id)
                        .bind(tid)
                        .execute(&app.pool)
                        .await
                        .ok();
                } else {
                    thread_id = None;
                }
            }
            Some(_) => {}
        }
    }

    let insert = sqlx::query(
        "INSERT INTO chat_log(
             id, user_id, user_id_alias, source, text, tags,
             thread_id, vantage_id, request_id, created_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(rec_id)
    .bind(&user_id)
    .bind(&user_id_alias)
    .bind(&source)
    .bind(&text)
    .bind(&tags)
    .bind(thread_id)
    .bind(&vantage_id)
    .bind(&request_id)
    .bind(created_dt)
    .execute(&app.pool)
    .await;

    if let Err(e) = insert {
        warn!("chat_log insert failed: {}", e);
    } else if let Some(tid) = thread_id {
        sqlx::query("UPDATE threads SET updated_at=now() WHERE id=$1 AND user_id=$2")
            .bind(tid)
            .bind(&user_id)
            .execute(&app.pool)
            .await
            .ok();
    }

    // 2) Embed + upsert into Qdrant. The request never fails because the
    // embedder or vector store is down.
    match app.embedder.embed(&text).await {
        Ok(vec) => {
            let created = created_dt.to_rfc3339();
            let payload = json!({
                "text": text,
                "user_id": user_id,
                "request_id": request_id,
                "user_id_alias": user_id_alias,
                "source": source,
                "tags": tags,
                "thread_id": thread_id.map(|t| t.to_string()),
                "vantage_id": vantage_id,
                "created_at": created,
                "updated_at": created,
            });
            if let Err(e) = app
                .vector
                .upsert(MEMORY_COLLECTION, &rec_id.to_string(), vec, &payload)
                .await
            {
                warn!("memory_raw upsert failed: {}", e);
            }
        }
        Err(e) => warn!("log embed failed, transcript remains authoritative: {}", e),
    }

    info!(id = %rec_id, user_id = %user_id, "logged chat message");
    Ok(Json(json!({"status": "ok", "id": rec_id, "request_id": request_id})))
}
