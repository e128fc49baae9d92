// src/api/rag.rs
// The main chat path: persona + personal memory + corpus retrieval composed
// into a system prompt, answered by the chat provider, with a feedback
// endpoint that reinforces the memories the answer used.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::retrieve::apply_memory_feedback;
use crate::identity::resolve_canonical_user_id;
use crate::overlay::overlay_to_instructions;
use crate::persona::{
    build_system_prompt, classify_feedback_markers, extract_tag_from_message,
    is_identity_or_policy_query, is_pure_reentry_greeting, personal_memory_ids,
    quick_persona_refresh, PromptOptions,
};
use crate::profiles::desire::{load_latest_vb_desire_profile, vb_desire_bias_map};
use crate::profiles::gravity::{compute_misalignment, load_gravity_profile};
use crate::retrieval::tags::infer_query_tags;
use crate::state::{rag_key, AppState, LastResult};
use crate::temporal;
use crate::vector::{Hit, MEMORY_COLLECTION};

pub const GREETING_SYSTEM_PROMPT: &str = "You are a personal assistant with long-term memory.\nSpeak like a normal, thoughtful person in natural prose.\nAvoid bullet points and numbered menus unless explicitly requested.\nDo not steer with category choices.\nDo not suggest next steps at the end.\nAsk one open-ended question that helps the user continue.\n";

#[derive(Debug, Deserialize)]
pub struct RagQuery {
    pub user_id: String,
    pub message: String,
    pub thread_id: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    pub overlay: Option<JsonValue>,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize)]
pub struct VantageQueryParam {
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackPayload {
    pub user_id: String,
    pub message: String,
    pub thread_id: Option<String>,
}

/// Why this answer looks the way it does: tags, feedback totals, topic
/// coverage, a skeleton-vs-prose consistency check, gravity misalignment,
/// and the temporal bucket.
pub async fn build_meta_explanation(
    app: &AppState,
    user_id: &str,
    message: &str,
    memory_chunks: &[Hit],
) -> JsonValue {
    let query_tags: Vec<String> = {
        let mut t = infer_query_tags(message.trim());
        t.sort();
        t.dedup();
        t
    };

    let mut total_pos = 0i64;
    let mut total_neg = 0i64;
    let mut topic_tags: Vec<String> = Vec::new();

    for m in memory_chunks {
        let payload = &m.payload;
        let (pos, neg) = crate::profiles::payload_feedback(payload);
        total_pos += pos;
        total_neg += neg;

        if let Some(tags) = payload.get("tags").and_then(|v| v.as_array()) {
            for t in tags.iter().filter_map(|t| t.as_str()) {
                if let Some(topic) = t.strip_prefix("topic:") {
                    if !topic_tags.iter().any(|x| x == topic) {
                        topic_tags.push(topic.to_string());
                    }
                }
            }
        }
    }
    topic_tags.sort();

    let mut summary_parts: Vec<String> = Vec::new();
    let mut fmt_bits: Vec<&str> = Vec::new();
    if query_tags.iter().any(|t| t == "format:skeleton") {
        fmt_bits.push("user explicitly asked for skeleton / outline style");
    }
    if query_tags.iter().any(|t| t == "format:prose") {
        fmt_bits.push("user explicitly asked for narrative / prose style");
    }
    if !fmt_bits.is_empty() {
        summary_parts.push(format!("format: {}", fmt_bits.join("; ")));
    }
    if total_pos != 0 || total_neg != 0 {
        summary_parts.push(format!("related memories have feedback +{total_pos} / -{total_neg}"));
    }
    if !topic_tags.is_empty() {
        summary_parts.push(format!("topics seen in used memories: {}", topic_tags.join(", ")));
    }

    // Consistency: historical format leaning vs the current request.
    let mut skeleton_n = 0usize;
    let mut prose_n = 0usize;
    for m in memory_chunks.iter().filter(|m| m.collection == MEMORY_COLLECTION) {
        if let Some(tags) = m.payload.get("tags").and_then(|v| v.as_array()) {
            for t in tags.iter().filter_map(|t| t.as_str()) {
                match t {
                    "format:skeleton" => skeleton_n += 1,
                    "format:prose" => prose_n += 1,
                    _ => {}
                }
            }
        }
    }
    let historical_fmt = if skeleton_n > prose_n {
        "skeleton-leaning"
    } else if prose_n > skeleton_n {
        "prose-leaning"
    } else {
        "undetermined"
    };
    let current_fmt = if query_tags.iter().any(|t| t == "format:skeleton") {
        "skeleton"
    } else if query_tags.iter().any(|t| t == "format:prose") {
        "prose"
    } else {
        "unspecified"
    };
    let format_shift = match (current_fmt, historical_fmt) {
        ("skeleton", "prose-leaning") => "user_now_requesting_skeleton_vs_historical_prose",
        ("prose", "skeleton-leaning") => "user_now_requesting_prose_vs_historical_skeleton",
        _ => "aligned_or_unknown",
    };

    // Gravity misalignment with labels.
    let gravity_weights = if user_id.is_empty() {
        HashMap::new()
    } else {
        load_gravity_profile(&app.vector, user_id).await
    };
    let (misalignment, misalignment_label) = if gravity_weights.is_empty() {
        (0.0, "no_gravity")
    } else {
        let m = compute_misalignment(&query_tags, &gravity_weights);
        let label = if m < 0.15 {
            "aligned"
        } else if m < 0.40 {
            "mild_escape"
        } else if m < 0.70 {
            "strong_escape"
        } else {
            "disconnected"
        };
        (m, label)
    };

    let temporal = temporal::temporal_info(&app.pool, user_id).await;

    json!({
        "query_tags": query_tags,
        "feedback_summary": {"positive": total_pos, "negative": total_neg},
        "topic_tags": topic_tags,
        "summary": summary_parts.join(" "),
        "consistency": {
            "historical_format": historical_fmt,
            "current_request_format": current_fmt,
            "format_shift": format_shift,
        },
        "gravity": {"misalignment": misalignment, "label": misalignment_label},
        "temporal": {
            "seconds_since_last_user_message": temporal.seconds_since_last_user_message,
            "bucket": temporal.bucket,
        },
    })
}

async fn cache_last_result(
    app: &AppState,
    user_id: &str,
    thread_id: Option<&str>,
    answer: &str,
    memory_ids: Vec<String>,
) {
    let mut cache = app.last_rag_result.write().await;
    cache.insert(
        rag_key(user_id, thread_id),
        LastResult { answer: answer.to_string(), memory_ids, answer_id: None },
    );
}

/// POST /rag/query
pub async fn rag_query(
    State(app): State<Arc<AppState>>,
    Query(q): Query<VantageQueryParam>,
    Json(payload): Json<RagQuery>,
) -> ApiResult<Json<JsonValue>> {
    let vantage_id = q
        .vantage_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("default")
        .to_string();

    let overlay_text = payload
        .overlay
        .as_ref()
        .map(overlay_to_instructions)
        .unwrap_or_default();

    // Canonicalize before any cache keys or card loads.
    let alias_uid = payload.user_id.clone();
    let (user_id, _) = resolve_canonical_user_id(&app.pool, &vantage_id, &alias_uid).await;
    if user_id != alias_uid {
        info!(alias = %alias_uid, canon = %user_id, vid = %vantage_id, "rag_query canonicalized user id");
    }

    let model_id = app.config.chat_model.clone();

    // Identity/policy queries: persona cards already answer these; retrieval
    // only adds noise.
    if is_identity_or_policy_query(&payload.message) {
        let system_prompt = build_system_prompt(
            &app.vector,
            &user_id,
            &[],
            &overlay_text,
            &vantage_id,
            PromptOptions::default(),
        )
        .await;
        let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &[]).await;
        meta["model"] = json!({"id": model_id.clone()});
        meta["identity"] = json!({
            "vantage_id": vantage_id,
            "user_id_alias": alias_uid.clone(),
            "canonical_user_id": user_id.clone(),
        });

        let answer = app
            .chat
            .chat_simple(&system_prompt, &payload.message, &model_id)
            .await
            .map_err(|e| ApiError::upstream_unavailable(format!("chat failed: {e}")))?;

        cache_last_result(&app, &user_id, payload.thread_id.as_deref(), &answer, vec![]).await;
        return Ok(Json(json!({
            "answer": answer,
            "memory_used": [],
            "system_prompt": system_prompt,
            "meta_explanation": meta,
        })));
    }

    // Pure re-entry greetings skip retrieval so "hi, I'm back" doesn't pull
    // in unrelated content.
    if is_pure_reentry_greeting(&payload.message) {
        let mut system_prompt = GREETING_SYSTEM_PROMPT.to_string();
        if !overlay_text.is_empty() {
            system_prompt = format!("{system_prompt}\n\n{overlay_text}");
        }

        let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &[]).await;
        meta["model"] = json!({"id": model_id.clone()});
        meta["identity"] = json!({
            "vantage_id": vantage_id,
            "user_id_alias": alias_uid.clone(),
            "canonical_user_id": user_id.clone(),
        });

        let bucket = meta["temporal"]["bucket"].as_str().unwrap_or("unknown").to_string();
        let query_tags: Vec<String> = meta["query_tags"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default();
        let reentry_prefix = if temporal::should_add_reentry_line(&bucket, &payload.message, &query_tags) {
            temporal::build_reentry_line(&bucket)
        } else {
            String::new()
        };

        let mut answer = app
            .chat
            .chat_simple(&system_prompt, &payload.message, &model_id)
            .await
            .map_err(|e| ApiError::upstream_unavailable(format!("chat failed: {e}")))?;
        if !reentry_prefix.is_empty() {
            answer = format!("{reentry_prefix}{answer}");
        }

        cache_last_result(&app, &user_id, payload.thread_id.as_deref(), &answer, vec![]).await;
        return Ok(Json(json!({
            "answer": answer,
            "memory_used": [],
            "system_prompt": system_prompt,
            "meta_explanation": meta,
        })));
    }

    let retriever = app.retriever();
    let top_k = payload.top_k.max(1);

    // vb-desire bias for the personal rerank.
    let bias_map = match load_latest_vb_desire_profile(&app.vector, &user_id).await {
        Some(card) => vb_desire_bias_map(&card),
        None => HashMap::new(),
    };

    // 1) personal memory, oversampled so the rerank has room, then cut.
    let mut personal_memory = retriever
        .retrieve_personal_memory(
            &user_id,
            &payload.message,
            top_k.min(8),
            None,
            &vantage_id,
            &bias_map,
        )
        .await;
    personal_memory.truncate(top_k.min(3));

    // 2) corpus from all other collections.
    let corpus_memory = retriever
        .unified_retrieve(&payload.message, top_k, None, &vantage_id)
        .await;

    // 3) combined list, personal first.
    let mut memory_chunks: Vec<Hit> = personal_memory.clone();
    memory_chunks.extend(corpus_memory);

    // 4) persona + memory system prompt, plus the explanation.
    let mut system_prompt = build_system_prompt(
        &app.vector,
        &user_id,
        &memory_chunks,
        &overlay_text,
        &vantage_id,
        PromptOptions::default(),
    )
    .await;

    let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &memory_chunks).await;
    meta["model"] = json!({"id": model_id.clone()});
    meta["identity"] = json!({
        "vantage_id": vantage_id,
        "user_id_alias": alias_uid.clone(),
        "canonical_user_id": user_id.clone(),
    });

    // Gravity escape note: when the request runs against the profile, tell
    // the model to favor the explicit request over past patterns.
    let misalignment = meta["gravity"]["misalignment"].as_f64().unwrap_or(0.0);
    if misalignment >= 0.4 {
        let label = meta["gravity"]["label"].as_str().unwrap_or("aligned").to_string();
        system_prompt.push_str(&format!(
            "\n\n[gravity-note] Current request is classified as '{label}' (misalignment={misalignment:.3}) relative to the user's usual style. Prioritize satisfying the explicit request and local context, even if it differs from past patterns or preferences.\n"
        ));
    }

    let bucket = meta["temporal"]["bucket"].as_str().unwrap_or("unknown").to_string();
    let query_tags: Vec<String> = meta["query_tags"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    let reentry_prefix = if temporal::should_add_reentry_line(&bucket, &payload.message, &query_tags) {
        temporal::build_reentry_line(&bucket)
    } else {
        String::new()
    };

    // 5) generate the answer once.
    let mut answer = app
        .chat
        .chat_simple(&system_prompt, &payload.message, &model_id)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("chat failed: {e}")))?;
    if !reentry_prefix.is_empty() {
        answer = format!("{reentry_prefix}{answer}");
    }

    // 6) remember which personal memories fed this answer.
    let memory_ids = personal_memory_ids(&personal_memory);
    cache_last_result(&app, &user_id, payload.thread_id.as_deref(), &answer, memory_ids).await;

    let memory_used: Vec<JsonValue> = memory_chunks
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

    Ok(Json(json!({
        "answer": answer,
        "memory_used": memory_used,
        "system_prompt": system_prompt,
        "meta_explanation": meta,
    })))
}

/// Classify a follow-up message as feedback. Markers first; when still
/// neutral and a model is configured, ask it for exactly one word.
pub async fn classify_feedback(app: &AppState, last_answer: &str, user_message: &str) -> String {
    if let Some(verdict) = classify_feedback_markers(user_message) {
        return verdict.to_string();
    }

    let prompt_system = "You are a classifier. The user has just reacted to an answer.\nYour job is to decide if their reaction expresses positive, negative, or neutral\nfeedback about how helpful that answer was.\n\nRespond with exactly one word: 'positive', 'negative', or 'neutral'.";
    let prompt_user = format!(
        "Answer that was given:\n{}\n\nUser's reaction:\n{}\n\nClassify the user's reaction.",
        last_answer.trim(),
        user_message.trim()
    );

    match app
        .chat
        .chat_simple(prompt_system, &prompt_user, &app.config.feedback_model)
        .await
    {
        Ok(raw) => {
            let raw = raw.to_lowercase();
            if raw.contains("positive") {
                "positive".to_string()
            } else if raw.contains("negative") {
                "negative".to_string()
            } else {
                "neutral".to_string()
            }
        }
        Err(e) => {
            warn!("feedback classifier fallback failed: {}", e);
            "neutral".to_string()
        }
    }
}

/// POST /rag/feedback — interpret the latest message as feedback on the
/// previous answer and reinforce the memories it used.
pub async fn rag_feedback(
    State(app): State<Arc<AppState>>,
    Query(q): Query<VantageQueryParam>,
    Json(payload): Json<FeedbackPayload>,
) -> ApiResult<Json<JsonValue>> {
    let vantage_id = q
        .vantage_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("default")
        .to_string();

    let (user_id, _) = resolve_canonical_user_id(&app.pool, &vantage_id, &payload.user_id).await;

    let fb_text = payload.message.trim().to_string();
    if fb_text.is_empty() {
        return Ok(Json(json!({"status": "empty"})));
    }

    let key = rag_key(&user_id, payload.thread_id.as_deref());
    let last = {
        let cache = app.last_rag_result.read().await;
        cache
            .get(&key)
            .cloned()
            // Older clients never sent thread_id.
            .or_else(|| {
                if key.1.is_empty() {
                    None
                } else {
                    cache.get(&rag_key(&user_id, None)).cloned()
                }
            })
    };
    let Some(last) = last else {
        return Ok(Json(json!({"status": "no_last_answer"})));
    };

    let signal = classify_feedback(&app, &last.answer, &fb_text).await;
    let tag = extract_tag_from_message(&fb_text);

    if signal == "neutral" && tag.is_none() {
        return Ok(Json(json!({"status": "neutral"})));
    }

    if last.memory_ids.is_empty() {
        return Ok(Json(json!({"status": "no_memory_ids"})));
    }

    let mut updated = 0usize;
    for mid in &last.memory_ids {
        match apply_memory_feedback(&app, &user_id, mid, &signal, tag.as_deref()).await {
            Ok(crate::api::retrieve::FeedbackOutcome::Updated { .. }) => updated += 1,
            Ok(_) => {}
            Err(e) => warn!(memory_id = %mid, "feedback apply failed: {}", e),
        }
    }

    // Refresh the style card regardless of signal outcome.
    let refresh = quick_persona_refresh(&app.vector, &app.embedder, &user_id, 100).await;
    info!(user_id = %user_id, status = %refresh["status"], "style card refresh");

    Ok(Json(json!({"status": "ok", "signal": signal, "tag": tag, "updated": updated})))
}
