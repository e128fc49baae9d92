// src/api/cards.rs
// Card artifact console: list/upsert/delete card points in memory_raw, plus
// the singleton rebuild endpoints for the gravity and desire profiles.
// Singleton cards are delete-locked; only the owning daemon rewrites them.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use qdrant_client::qdrant::Filter;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::api::error::{ApiError, ApiResult};
use crate::identity::{resolve_canonical_user_id, scoped_card_id};
use crate::profiles::{desire, gravity};
use crate::state::AppState;
use crate::temporal;
use crate::vector::{match_field, MEMORY_COLLECTION};

const CARD_KINDS_DEFAULT: &[&str] = &[
    "user_identity",
    "assistant_identity",
    "user_instructions",
    "style",
    "style_mode",
    "preference",
    "gravity_profile",
    "vb_desire_profile",
    "persona_profile",
    "preference_profile",
];

#[derive(Debug, Deserialize)]
pub struct CardsListQuery {
    pub limit: Option<usize>,
    pub kinds: Option<String>,
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VantageQueryParam {
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CardUpsertRequest {
    pub kind: String,
    pub topic_key: Option<String>,
    pub text: Option<String>,
    pub tags: Option<Vec<String>>,
    pub base_importance: Option<f64>,
    pub payload: Option<JsonValue>,
    pub if_match_updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserIdRequest {
    pub user_id: String,
}

fn vid_of(v: &Option<String>) -> String {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// GET /cards/{user_id}
pub async fn cards_list(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<CardsListQuery>,
) -> ApiResult<Json<JsonValue>> {
    let vid = vid_of(&q.vantage_id);
    let (uid, _) = resolve_canonical_user_id(&app.pool, &vid, &user_id).await;

    let kinds: Vec<String> = match &q.kinds {
        Some(s) => s
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        None => CARD_KINDS_DEFAULT.iter().map(|s| s.to_string()).collect(),
    };

    let limit = q.limit.unwrap_or(50);
    let scan_limit = (limit * 8).max(256);

    let filter = Filter::must([match_field("user_id", &uid)]);
    let points = app
        .vector
        .scroll(MEMORY_COLLECTION, Some(filter), scan_limit, true)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("card scan failed: {e}")))?;

    let mut items: Vec<JsonValue> = points
        .into_iter()
        .filter(|p| {
            let kind = p.payload.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            kinds.iter().any(|k| k == kind)
        })
        .filter(|p| {
            let pv = p.payload.get("vantage_id").and_then(|v| v.as_str()).unwrap_or("");
            pv == vid || (pv.is_empty() && vid == "default")
        })
        .map(|p| {
            json!({
                "id": p.id,
                "kind": p.payload.get("kind"),
                "source": p.payload.get("source"),
                "tags": p.payload.get("tags").cloned().unwrap_or(json!([])),
                "created_at": p.payload.get("created_at"),
                "updated_at": p.payload.get("updated_at"),
                "text": p.payload.get("text").cloned().unwrap_or(json!("")),
                "payload": p.payload,
            })
        })
        .collect();

    // Newest first when timestamps exist.
    items.sort_by_key(|x| {
        std::cmp::Reverse(
            x.get("updated_at")
                .or_else(|| x.get("created_at"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        )
    });
    if limit > 0 {
        items.truncate(limit);
    }

    Ok(Json(json!({"status": "ok", "user_id": uid, "count": items.len(), "items": items})))
}

/// POST /cards/{user_id} — idempotent card upsert with deterministic id and
/// optimistic concurrency on updated_at.
pub async fn cards_upsert(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<VantageQueryParam>,
    Json(req): Json<CardUpsertRequest>,
) -> ApiResult<Json<JsonValue>> {
    let vid = vid_of(&q.vantage_id);
    let (uid, _) = resolve_canonical_user_id(&app.pool, &vid, &user_id).await;

    let kind = req.kind.trim().to_string();
    if kind.is_empty() {
        return Err(ApiError::bad_request("missing kind"));
    }
    let topic_key = req
        .topic_key
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("__singleton__")
        .to_string();

    let card_id = scoped_card_id(&uid, &vid, &kind, &topic_key).to_string();

    // Existing payload: preserves created_at and carries the concurrency tag.
    let existing = app
        .vector
        .retrieve(MEMORY_COLLECTION, &[card_id.clone()], false)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("card retrieve failed: {e}")))?;
    let old = existing
        .into_iter()
        .next()
        .map(|p| p.payload)
        .unwrap_or(json!({}));

    let old_updated_at = old
        .get("updated_at")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if let Some(expected) = req.if_match_updated_at.as_deref() {
        if !old_updated_at.is_empty() && expected != old_updated_at {
            return Err(ApiError::conflict(format!(
                "updated_at_mismatch: current={old_updated_at}"
            )));
        }
    }

    let now = Utc::now().to_rfc3339();
    let created = old
        .get("created_at")
        .and_then(|v| v.as_str())
        .unwrap_or(&now)
        .to_string();

    let tags = match &req.tags {
        Some(t) => json!(t),
        None => old
            .get("tags")
            .cloned()
            .unwrap_or_else(|| json!(["card", kind.as_str()])),
    };
    let base_importance = req
        .base_importance
        .or_else(|| old.get("base_importance").and_then(|v| v.as_f64()))
        .unwrap_or(0.7);
    let text = req
        .text
        .clone()
        .or_else(|| old.get("text").and_then(|v| v.as_str()).map(String::from))
        .unwrap_or_default();

    let mut payload = json!({
        "user_id": uid.clone(),
        "vantage_id": vid.clone(),
        "kind": kind,
        "topic_key": topic_key,
        "source": "memory_card",
        "tags": tags,
        "base_importance": base_importance,
        "created_at": created.clone(),
        "updated_at": now.clone(),
        "text": text.clone(),
    });

    // Merge extra fields without letting callers clobber identity fields.
    if let Some(extra) = req.payload.as_ref().and_then(|v| v.as_object()) {
        let obj = payload.as_object_mut().unwrap();
        for (k, v) in extra {
            if matches!(k.as_str(), "user_id" | "kind" | "topic_key" | "source" | "created_at") {
                continue;
            }
            obj.insert(k.clone(), v.clone());
        }
    }

    let embed_text = if text.is_empty() {
        format!("{} card for {uid}", payload["kind"].as_str().unwrap_or("card"))
    } else {
        text
    };
    let vector = app
        .embedder
        .embed(&embed_text)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("embed failed: {e}")))?;

    app.vector
        .upsert(MEMORY_COLLECTION, &card_id, vector, &payload)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("card upsert failed: {e}")))?;

    Ok(Json(json!({
        "status": "ok",
        "user_id": uid,
        "vantage_id": vid,
        "card_id": card_id,
        "kind": payload["kind"].clone(),
        "topic_key": payload["topic_key"].clone(),
        "created_at": created,
        "updated_at": now,
    })))
}

/// DELETE /cards/{user_id}/{card_id} — ownership-checked; singletons are
/// locked against user delete.
pub async fn cards_delete(
    State(app): State<Arc<AppState>>,
    Path((user_id, card_id)): Path<(String, String)>,
    Query(q): Query<VantageQueryParam>,
) -> ApiResult<Json<JsonValue>> {
    let vid = vid_of(&q.vantage_id);
    let (uid, _) = resolve_canonical_user_id(&app.pool, &vid, &user_id).await;

    let points = app
        .vector
        .retrieve(MEMORY_COLLECTION, &[card_id.clone()], false)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("card retrieve failed: {e}")))?;

    let Some(point) = points.into_iter().next() else {
        return Ok(Json(json!({"status": "ok", "note": "not_found"})));
    };

    let owner = point
        .payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim();
    if owner != uid {
        return Err(ApiError::bad_request("user_mismatch"));
    }

    let topic_key = point
        .payload
        .get("topic_key")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim();
    if topic_key == "__singleton__" {
        return Err(ApiError::forbidden(format!(
            "singleton_locked: card_id={card_id}"
        )));
    }

    app.vector
        .delete_points(MEMORY_COLLECTION, &[card_id.clone()])
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("card delete failed: {e}")))?;

    Ok(Json(json!({"status": "ok", "deleted": card_id})))
}

/// POST /gravity/rebuild
pub async fn gravity_rebuild(
    State(app): State<Arc<AppState>>,
    Query(q): Query<VantageQueryParam>,
    Json(body): Json<UserIdRequest>,
) -> ApiResult<Json<JsonValue>> {
    let vid = vid_of(&q.vantage_id);
    let (user_id, alias_user_id) = resolve_canonical_user_id(&app.pool, &vid, &body.user_id).await;

    let weights = gravity::compute_gravity(&app.vector, &user_id).await;
    gravity::write_gravity_card(&app.vector, &app.embedder, &user_id, &weights)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("gravity write failed: {e}")))?;

    Ok(Json(json!({
        "status": "ok",
        "user_id": user_id,
        "alias_user_id": alias_user_id,
        "weights": weights,
        "note": "gravity_profile updated",
    })))
}

/// POST /vb_desire/rebuild
pub async fn vb_desire_rebuild(
    State(app): State<Arc<AppState>>,
    Query(q): Query<VantageQueryParam>,
    Json(body): Json<UserIdRequest>,
) -> ApiResult<Json<JsonValue>> {
    let vid = vid_of(&q.vantage_id);
    let (user_id, alias_user_id) = resolve_canonical_user_id(&app.pool, &vid, &body.user_id).await;

    let card = desire::build_vb_desire_profile(&app.vector, &user_id, 5000).await;
    desire::write_vb_desire_profile_card(&app.vector, &app.embedder, &user_id, &card)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("vb_desire write failed: {e}")))?;

    Ok(Json(json!({
        "status": "ok",
        "user_id": user_id,
        "alias_user_id": alias_user_id,
        "card": card,
        "note": "vb_desire_profile updated",
    })))
}

/// GET /temporal/{user_id}
pub async fn temporal_info(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let info = temporal::temporal_info(&app.pool, &user_id).await;
    Ok(Json(json!({
        "user_id": user_id,
        "seconds_since_last_user_message": info.seconds_since_last_user_message,
        "bucket": info.bucket,
    })))
}
