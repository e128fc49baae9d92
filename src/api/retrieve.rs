// src/api/retrieve.rs
// Raw retrieval endpoints: corpus search, personal memory search, and the
// feedback sink that mutates memory-point payloads.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::identity::resolve_canonical_user_id;
use crate::state::AppState;
use crate::vector::{match_field, MEMORY_COLLECTION};

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    /// If set and not "ALL", restrict to that one collection.
    pub collection: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    pub user_id: Option<String>,
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackSignal {
    pub user_id: String,
    pub memory_id: String,
    /// "positive", "negative", or "neutral"
    pub signal: String,
    pub tag: Option<String>,
}

/// POST /retrieve — vector search across one or all non-ignored collections.
pub async fn retrieve(
    State(app): State<Arc<AppState>>,
    Json(body): Json<RetrieveRequest>,
) -> ApiResult<Json<JsonValue>> {
    let q = body.query.trim();
    if q.is_empty() {
        return Err(ApiError::bad_request("missing query"));
    }

    let vec = app
        .embedder
        .embed(q)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("embed failed: {e}")))?;

    let collections: Vec<String> = match body.collection.as_deref() {
        Some(c) if c != "ALL" => vec![c.to_string()],
        _ => app
            .vector
            .corpus_collections()
            .await
            .map_err(|e| ApiError::upstream_unavailable(format!("list collections failed: {e}")))?,
    };

    let top_k = body.top_k.unwrap_or(app.config.retrieve_top_k).max(1);
    let thr = body
        .score_threshold
        .or(app.config.retrieve_threshold)
        .unwrap_or(0.30);

    let mut all_hits = Vec::new();
    for coll in &collections {
        match app.vector.search(coll, &vec, top_k as u64, Some(thr), None).await {
            Ok(hits) => all_hits.extend(hits),
            Err(e) => warn!(collection = %coll, "search failed: {}", e),
        }
    }

    all_hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    all_hits.truncate(top_k);

    let results: Vec<JsonValue> = all_hits
        .iter()
        .map(|h| {
            json!({
                "collection": h.collection,
                "id": h.id,
                "score": h.score,
                "payload": h.payload,
            })
        })
        .collect();

    Ok(Json(json!({"status": "ok", "top_k": top_k, "results": results})))
}

/// POST /retrieve_memory — personal/episodic memory from memory_raw.
pub async fn retrieve_memory(
    State(app): State<Arc<AppState>>,
    Json(body): Json<MemoryRequest>,
) -> ApiResult<Json<JsonValue>> {
    let q = body.query.trim();
    if q.is_empty() {
        return Err(ApiError::bad_request("missing query"));
    }

    let vec = app
        .embedder
        .embed(q)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("embed failed: {e}")))?;

    let mut filter = qdrant_client::qdrant::Filter::default();
    if let Some(alias) = body.user_id.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        let vid = body
            .vantage_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("default");
        let (uid, _) = resolve_canonical_user_id(&app.pool, vid, alias).await;
        filter.must.push(match_field("user_id", &uid));
    }
    let filter = if filter.must.is_empty() { None } else { Some(filter) };

    let top_k = body.top_k.unwrap_or(5).max(1);
    let hits = app
        .vector
        .search(
            MEMORY_COLLECTION,
            &vec,
            top_k as u64,
            Some(body.score_threshold.unwrap_or(0.0)),
            filter,
        )
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("memory search failed: {e}")))?;

    let results: Vec<JsonValue> = hits
        .iter()
        .map(|h| {
            json!({
                "collection": MEMORY_COLLECTION,
                "id": h.id,
                "score": h.score,
                "payload": h.payload,
            })
        })
        .collect();

    Ok(Json(json!({"status": "ok", "top_k": top_k, "results": results})))
}

/// Outcome of applying one feedback signal to a memory point.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Updated { positive: i64, negative: i64 },
    NotFound,
    NoVector,
    UserMismatch,
}

/// Apply a feedback signal to one memory point: bump payload.feedback
/// counters, append the optional user tag, and re-upsert with the original
/// vector. Shared by the endpoint and the chat feedback paths.
pub async fn apply_memory_feedback(
    app: &AppState,
    user_id: &str,
    memory_id: &str,
    signal: &str,
    tag: Option<&str>,
) -> Result<FeedbackOutcome, ApiError> {
    let points = app
        .vector
        .retrieve(MEMORY_COLLECTION, &[memory_id.to_string()], true)
        .await
        .map_err(|e| {
            warn!(memory_id = %memory_id, "feedback retrieve failed: {}", e);
            ApiError::upstream_unavailable("retrieve_failed")
        })?;

    let Some(point) = points.into_iter().next() else {
        return Ok(FeedbackOutcome::NotFound);
    };

    let mut payload = point.payload;
    let Some(vector) = point.vector else {
        warn!(memory_id = %memory_id, "feedback point has no vector");
        return Ok(FeedbackOutcome::NoVector);
    };

    let payload_user = payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if !payload_user.is_empty() && payload_user.to_lowercase() != user_id.to_lowercase() {
        return Ok(FeedbackOutcome::UserMismatch);
    }

    let mut pos = payload
        .get("feedback")
        .and_then(|f| f.get("positive_signals"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let mut neg = payload
        .get("feedback")
        .and_then(|f| f.get("negative_signals"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    match signal.to_lowercase().as_str() {
        "positive" => pos += 1,
        "negative" => neg += 1,
        _ => {} // neutral leaves the counters alone
    }

    let obj = payload.as_object_mut().ok_or_else(|| ApiError::internal("malformed payload"))?;
    obj.insert(
        "feedback".into(),
        json!({
            "positive_signals": pos,
            "negative_signals": neg,
            "last_feedback_at": Utc::now().to_rfc3339(),
        }),
    );

    if let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) {
        let mut user_tags: Vec<String> = obj
            .get("user_tags")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if !user_tags.iter().any(|t| t == tag) {
            user_tags.push(tag.to_string());
        }
        obj.insert("user_tags".into(), json!(user_tags));
    }

    app.vector
        .upsert(MEMORY_COLLECTION, &point.id, vector, &payload)
        .await
        .map_err(|e| {
            warn!(memory_id = %memory_id, "feedback upsert failed: {}", e);
            ApiError::upstream_unavailable("upsert_failed")
        })?;

    info!(memory_id = %memory_id, signal = %signal, pos, neg, "memory feedback recorded");
    Ok(FeedbackOutcome::Updated { positive: pos, negative: neg })
}

/// POST /memory_feedback — attach a feedback signal to one memory point.
/// Updates payload.feedback counters and appends any user tag; ranking is
/// unaffected until the next retrieval reads the counters.
pub async fn memory_feedback(
    State(app): State<Arc<AppState>>,
    Json(sig): Json<FeedbackSignal>,
) -> ApiResult<Json<JsonValue>> {
    match apply_memory_feedback(&app, &sig.user_id, &sig.memory_id, &sig.signal, sig.tag.as_deref())
        .await?
    {
        FeedbackOutcome::Updated { positive, negative } => Ok(Json(json!({
            "status": "ok",
            "memory_id": sig.memory_id,
            "positive_signals": positive,
            "negative_signals": negative,
        }))),
        FeedbackOutcome::NotFound => Ok(Json(json!({"status": "ok", "note": "point_not_found"}))),
        FeedbackOutcome::NoVector => Ok(Json(json!({"status": "ok", "note": "no_vector"}))),
        FeedbackOutcome::UserMismatch => Ok(Json(json!({"status": "ok", "note": "user_mismatch"}))),
    }
}
