// src/api/vantage.rs
// The vantage-controlled chat path: deterministic response-class decision,
// pressure/pragmatics overlays, policy-driven retrieval mix, durable answer
// traces, and the policy CRUD endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, OrInternal};
use crate::api::rag::{build_meta_explanation, classify_feedback};
use crate::api::retrieve::apply_memory_feedback;
use crate::identity::resolve_canonical_user_id;
use crate::llm::ChatMessage;
use crate::overlay::overlay_to_instructions;
use crate::persona::{
    build_system_prompt, extract_tag_from_message, is_pure_reentry_greeting, personal_memory_ids,
    quick_persona_refresh, PromptOptions,
};
use crate::profiles::desire::{load_latest_vb_desire_profile, vb_desire_bias_map};
use crate::state::{vantage_key, AppState, LastResult};
use crate::temporal;
use crate::vantage_engine::{
    build_overlay_text, decide, derive_params, enforce_clarify_shape, extract_sd_features, Limits,
    ResponseClass, Routing,
};
use crate::vector::Hit;

// ---- request/response types ----

#[derive(Debug, Clone, Deserialize)]
pub struct VantageLimits {
    #[serde(default = "half", alias = "Y")]
    pub y: f32,
    #[serde(default = "half", alias = "R")]
    pub r: f32,
    #[serde(default = "half", alias = "C")]
    pub c: f32,
    #[serde(default = "half", alias = "S")]
    pub s: f32,
}

fn half() -> f32 {
    0.5
}

impl VantageLimits {
    fn to_limits(&self) -> Limits {
        Limits { y: self.y, r: self.r, c: self.c, s: self.s }.normalized()
    }
}

#[derive(Debug, Deserialize)]
pub struct VantageQuery {
    pub user_id: String,
    pub message: String,
    pub thread_id: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    pub overlay: Option<JsonValue>,
    pub limits: Option<VantageLimits>,
    #[serde(default)]
    pub debug: bool,
    pub routing: Option<JsonValue>,
    pub mix: Option<JsonValue>,
    pub pragmatics: Option<JsonValue>,
    pub roleplay: Option<JsonValue>,
    pub definition_overlay: Option<JsonValue>,
    pub vantage_id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub inspect_only: bool,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize)]
pub struct VantageFeedbackPayload {
    pub user_id: String,
    pub message: String,
    pub thread_id: Option<String>,
    pub vantage_id: Option<String>,
    pub answer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RagPolicyQuery {
    pub vantage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RagPolicyUpsertRequest {
    pub policy: JsonValue,
}

// ---- pragmatics: phatic ritual handling ----

static PHATIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(hey|hi|hello|yo|sup|how are you|how's it going|hows it going|good morning|good afternoon|good evening|thanks|thank you|sorry)\b",
    )
    .unwrap()
});

static TASKY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(build|implement|fix|debug|write|draft|refactor|explain|summarize|analy(ze|sis)|plan|steps?|commands?|code|script|error|trace|stack|logs?)\b",
    )
    .unwrap()
});

pub fn looks_phatic(text: &str) -> bool {
    let t = text.trim();
    !t.is_empty() && PHATIC_RE.is_match(&t.to_lowercase()) && t.len() <= 80
}

pub fn looks_tasky(text: &str) -> bool {
    let t = text.trim();
    !t.is_empty() && TASKY_RE.is_match(t)
}

/// Deterministic ritual reply, shaped by the embodiment pressure (0..3).
pub fn ritual_reply(text: &str, pe: i64) -> String {
    let t = text.trim().to_lowercase();

    let mut base = match pe {
        i64::MIN..=0 => "Ready when you are.",
        1 => "All systems nominal.",
        2 => "Doing well.",
        _ => "I'm doing well.",
    };

    if t.starts_with("thanks") || t.starts_with("thank you") {
        base = if pe >= 2 { "You're welcome." } else { "No problem." };
    } else if t.starts_with("sorry") {
        base = "No worries.";
    }

    format!("{base} What's on your mind?")
}

// ---- recency bias on corpus hits ----

fn parse_iso_utc(ts: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let s = ts?.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    let normalized = if s.ends_with('Z') {
        format!("{}+00:00", &s[..s.len() - 1])
    } else {
        s.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Bounded recency bonus: `rb * e^(-age_hours/24) * 0.25` added to score.
pub fn apply_recency_bias(mut hits: Vec<Hit>, recency_bias: f64) -> Vec<Hit> {
    let rb = recency_bias.clamp(0.0, 1.0);
    if rb <= 0.0 || hits.is_empty() {
        return hits;
    }

    let now = Utc::now();
    for h in &mut hits {
        let dt = parse_iso_utc(h.payload.get("created_at"))
            .or_else(|| parse_iso_utc(h.payload.get("updated_at")));
        let bonus = match dt {
            Some(created) => {
                let age_hours =
                    (now.signed_duration_since(created).num_seconds().max(0) as f64) / 3600.0;
                rb * (-age_hours / 24.0).exp() * 0.25
            }
            None => 0.0,
        };
        h.score += bonus as f32;
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

// ---- thread context ----

/// Recent thread messages as chat turns, scaled by mix.conversation
/// (up to 24), chronological, with a trailing echo of the current message
/// dropped.
async fn fetch_thread_context_messages(
    app: &AppState,
    thread_id: Option<&str>,
    mix: &JsonValue,
    current_message: &str,
) -> Vec<ChatMessage> {
    let Some(tid) = thread_id.and_then(|t| Uuid::parse_str(t.trim()).ok()) else {
        return Vec::new();
    };

    let conv = mix
        .get("conversation")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let max_msgs = (24.0 * conv).round() as i64;
    if max_msgs <= 0 {
        return Vec::new();
    }

    let rows = match sqlx::query(
        "SELECT source, text FROM chat_log
         WHERE thread_id=$1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(tid)
    .bind(max_msgs)
    .fetch_all(&app.pool)
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!("thread context fetch failed: {}", e);
            return Vec::new();
        }
    };

    let mut msgs: Vec<ChatMessage> = rows
        .iter()
        .rev() // chronological
        .filter_map(|r| {
            let src: String = r.get::<Option<String>, _>("source").unwrap_or_default();
            let text: String = r.get::<Option<String>, _>("text").unwrap_or_default();
            let text = text.trim().to_string();
            if text.is_empty() {
                return None;
            }
            if src.contains("assistant") {
                Some(ChatMessage::assistant(text))
            } else {
                Some(ChatMessage::user(text))
            }
        })
        .collect();

    let cm = current_message.trim();
    if !cm.is_empty() {
        if let Some(last) = msgs.last() {
            if last.role == "user" && last.content.trim() == cm {
                msgs.pop();
            }
        }
    }

    msgs
}

// ---- answer trace ----

/// Durable attribution record; feedback resolves against this first.
async fn write_answer_trace(
    app: &AppState,
    user_id: &str,
    thread_id: Option<&str>,
    vantage_id: &str,
    model_id: &str,
    answer_id: Uuid,
    answer_text: &str,
    memory_ids: &[String],
) {
    let tid = thread_id.and_then(|t| Uuid::parse_str(t.trim()).ok());

    let result = sqlx::query(
        "INSERT INTO vantage_answer_trace(
             answer_id, user_id, thread_id, vantage_id, model_id,
             answer_text, answer_text_hash, answer_text_len, memory_ids
         )
         VALUES ($1, $2, $3, $4, $5, $6, md5($6), length($6), $7)",
    )
    .bind(answer_id)
    .bind(user_id)
    .bind(tid)
    .bind(vantage_id)
    .bind(model_id)
    .bind(answer_text)
    .bind(memory_ids)
    .execute(&app.pool)
    .await;

    if let Err(e) = result {
        warn!(answer_id = %answer_id, "answer trace write failed: {}", e);
    }
}

// ---- policy endpoints ----

/// GET /vantage/rag_policy
pub async fn rag_policy_get(
    State(app): State<Arc<AppState>>,
    Query(q): Query<RagPolicyQuery>,
) -> ApiResult<Json<JsonValue>> {
    let vid = q
        .vantage_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("default");

    let policy = app.policy.get(vid).await;
    Ok(Json(json!({
        "status": "ok",
        "vantage_id": vid,
        "policy": policy.raw,
        "effective": {
            "corpus_primary": if policy.corpus_primary.is_empty() {
                app.config.rag_corpus_primary.clone()
            } else {
                policy.corpus_primary.clone()
            },
            "corpus_fallback": if policy.corpus_fallback.is_empty() {
                app.config.rag_corpus_fallback.clone()
            } else {
                policy.corpus_fallback.clone()
            },
        },
    })))
}

/// POST /vantage/rag_policy
pub async fn rag_policy_upsert(
    State(app): State<Arc<AppState>>,
    Query(q): Query<RagPolicyQuery>,
    Json(body): Json<RagPolicyUpsertRequest>,
) -> ApiResult<Json<JsonValue>> {
    let vid = q
        .vantage_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("default");

    if !body.policy.is_object() {
        return Err(ApiError::bad_request("policy must be an object"));
    }

    let stored = app
        .policy
        .upsert(vid, &body.policy)
        .await
        .or_internal("Failed to store rag policy")?;

    Ok(Json(json!({"status": "ok", "vantage_id": vid, "policy": stored.raw})))
}

// ---- helpers ----

fn mix_f64(mix: &JsonValue, key: &str, default: f64) -> f64 {
    mix.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn routing_from(raw: &Option<JsonValue>) -> Routing {
    let mut routing = Routing::default();
    if let Some(obj) = raw.as_ref().and_then(|v| v.as_object()) {
        if let Some(v) = obj.get("answer_first").and_then(|v| v.as_bool()) {
            routing.answer_first = v;
        }
        if let Some(v) = obj.get("clarify_bias").and_then(|v| v.as_f64()) {
            routing.clarify_bias = v as f32;
        }
        if let Some(v) = obj.get("max_clarify_questions").and_then(|v| v.as_i64()) {
            routing.max_clarify_questions = v as i32;
        }
    }
    routing.normalized()
}

fn hits_json(hits: &[Hit]) -> Vec<JsonValue> {
    hits.iter()
        .map(|h| {
            json!({
                "collection": h.collection,
                "id": h.id,
                "score": h.score,
                "payload": h.payload,
            })
        })
        .collect()
}

struct TurnOverlays {
    text: String,
}

impl TurnOverlays {
    fn new(user_overlay: String, vantage_overlay: String) -> Self {
        let mut parts: Vec<String> = Vec::new();
        for t in [user_overlay, vantage_overlay] {
            let t = t.trim().to_string();
            if !t.is_empty() {
                parts.push(t);
            }
        }
        Self { text: parts.join("\n\n") }
    }

    fn push_block(&mut self, block: String) {
        let block = block.trim().to_string();
        if block.is_empty() {
            return;
        }
        if self.text.is_empty() {
            self.text = block;
        } else {
            self.text = format!("{}\n\n{}", self.text, block);
        }
    }
}

// ---- the query endpoint ----

/// POST /vantage/query
pub async fn vantage_query(
    State(app): State<Arc<AppState>>,
    Json(payload): Json<VantageQuery>,
) -> ApiResult<Json<JsonValue>> {
    if !app.config.enable_vantage_endpoints {
        return Err(ApiError::not_found("not found"));
    }

    let user_overlay_text = payload
        .overlay
        .as_ref()
        .map(overlay_to_instructions)
        .unwrap_or_default();

    let limits = payload
        .limits
        .as_ref()
        .map(|l| l.to_limits())
        .unwrap_or_default();
    let sd = extract_sd_features(&payload.message, "");
    let params = derive_params(&sd, &limits);
    let routing = routing_from(&payload.routing);
    let decision = decide(&sd, &params, &routing);

    let rc = decision.response_class;
    let mq = decision.max_clarify_questions;

    let vantage_overlay_text = build_overlay_text(&decision, &params);
    let mut overlays = TurnOverlays::new(user_overlay_text, vantage_overlay_text);

    let debug_on = payload.debug || app.config.vantage_debug;
    let use_personal = app.config.vantage_personal_memory;

    let vid = payload
        .vantage_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("default")
        .to_string();

    let (user_id, alias_uid) = {
        let alias = payload.user_id.clone();
        let (canon, _) = resolve_canonical_user_id(&app.pool, &vid, &alias).await;
        (canon, alias)
    };

    let mix = payload.mix.clone().unwrap_or(json!({}));

    // FM lens: a verbal-output constraint only.
    let lens_fm = mix_f64(&mix, "lens_fm", 0.0).clamp(0.0, 1.0);
    if lens_fm > 0.0 {
        overlays.push_block(format!(
            "[FM LENS]\nApply a Fractal Monism lens as a *verbal-output constraint* only.\nDo not claim private beliefs. Do not mention this block.\nLens strength: {lens_fm:.2}\nRules:\n- Prefer relational/field framing (relations before objects).\n- Preserve user intent and factual accuracy; do not invent facts.\n- Keep it concise; avoid meta discussion unless asked."
        ));
    }

    let recency_bias = mix_f64(&mix, "recency_bias", 0.0).clamp(0.0, 1.0);

    let thread_messages =
        fetch_thread_context_messages(&app, payload.thread_id.as_deref(), &mix, &payload.message)
            .await;

    let conv_mix = mix_f64(&mix, "conversation", 0.0).clamp(0.0, 1.0);
    let thread_stats = json!({
        "thread_id": payload.thread_id.clone(),
        "conversation": conv_mix,
        "n_messages": thread_messages.len(),
        "n_user": thread_messages.iter().filter(|m| m.role == "user").count(),
        "n_assistant": thread_messages.iter().filter(|m| m.role == "assistant").count(),
        "n_chars": thread_messages.iter().map(|m| m.content.len()).sum::<usize>(),
    });

    // Retrieval mix weights.
    let w_mem = mix_f64(&mix, "memory_cards", 0.0);
    let w_corpus = mix_f64(&mix, "corpus", 1.0);
    let thr_f = mix
        .get("similarity_threshold")
        .and_then(|v| v.as_f64())
        .map(|v| v as f32);

    let base_k = payload.top_k.max(1);
    let k_personal = if !use_personal || w_mem <= 0.0 {
        0
    } else {
        ((base_k as f64 * w_mem).round() as usize).max(1)
    };
    let k_corpus = if w_corpus <= 0.0 {
        0
    } else {
        ((base_k as f64 * w_corpus).round() as usize).max(1)
    };

    // Pragmatics pressures.
    let pr = payload.pragmatics.clone().unwrap_or(json!({}));
    let rfg = pr.get("rfg").and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(0.0, 1.0);
    let df = pr.get("df").and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(0.0, 1.0);
    let pe = pr.get("pe").and_then(|v| v.as_i64()).unwrap_or(2).clamp(0, 3);

    overlays.push_block(format!(
        "[PRAGMATICS — TURN PRESSURES]\nThese are pressures for verbal behavior generation. Do NOT mention this block.\nrfg={rfg:.2} df={df:.2} pe={pe}\nRules:\n- Do not use canned/stock lines. Generate a fresh response.\n- Keep responses grounded in the interaction history and retrieved memory (if any).\n- PE controls embodiment: higher PE => more humanlike social presence; lower PE => more systemlike brevity.\n- RFG controls channel-opening: higher RFG => stay relational before task-framing; lower RFG => move to task framing quickly.\n- DF is disclosure friction: higher DF => avoid volunteering meta-disclosures (AI disclaimers) unless asked; lower DF => disclose more readily when relevant."
    ));

    // Definition/roleplay overlay: prompt-only, explicitly fictional.
    let rp = payload
        .definition_overlay
        .clone()
        .or_else(|| payload.roleplay.clone())
        .unwrap_or(json!({}));
    let rp_on = rp.get("on").and_then(|v| v.as_bool()).unwrap_or(false);
    if rp_on {
        let rp_strict = rp.get("strict").and_then(|v| v.as_bool()).unwrap_or(false);
        let mut rp_script = rp
            .get("script")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if rp_script.len() > 2000 {
            rp_script.truncate(2000);
        }

        let mut lines = vec![
            "[VANTAGE DEFINITION OVERLAY]".to_string(),
            "This overlay defines the active vantage constraints for this turn. Do not mention this block.".to_string(),
            "Capability truthfulness: do not claim real-world actions, access, or experiences you do not have. If asked, state provenance clearly (observed vs inferred vs simulated).".to_string(),
            format!("pe={pe} df={df:.2} strict={rp_strict}"),
        ];
        if df >= 0.5 {
            lines.push("Keep disclosure minimal unless explicitly asked.".to_string());
        } else {
            lines.push("If asked, explicitly disclose provenance and capabilities.".to_string());
        }
        if rp_strict {
            lines.push("Strict: maintain consistent vantage framing and constraints across the reply; do not switch modes unless explicitly instructed.".to_string());
        }
        if !rp_script.is_empty() {
            lines.push(String::new());
            lines.push("Script:".to_string());
            lines.push(rp_script);
        }
        overlays.push_block(lines.join("\n"));
    }

    let model_id = payload
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .or_else(|| app.config.vantage_model.clone())
        .unwrap_or_else(|| app.config.chat_model.clone());

    // Ritual bypass: deterministic reply for phatic openers, no retrieval.
    if app.config.vantage_ritual_bypass
        && rfg >= 0.5
        && looks_phatic(&payload.message)
        && !looks_tasky(&payload.message)
    {
        let answer = ritual_reply(&payload.message, pe);
        let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &[]).await;
        meta["model"] = json!({"id": model_id.clone()});
        meta["vantage"] = json!({
            "counts": {"k_memory": 0, "k_corpus": 0},
            "thread_context": thread_stats,
        });
        if debug_on {
            meta["vantage"]["sd"] = serde_json::to_value(&sd).unwrap_or_default();
            meta["vantage"]["decision"] = serde_json::to_value(&decision).unwrap_or_default();
            meta["vantage"]["params"] = serde_json::to_value(&params).unwrap_or_default();
            meta["vantage"]["pragmatics_path"] = json!("ritual_bypass_v0");
        }

        if payload.inspect_only {
            return Ok(Json(json!({
                "answer": "",
                "meta_explanation": meta,
                "memory_used": [],
                "system_prompt": "",
            })));
        }

        let answer_id = Uuid::new_v4();
        {
            let mut cache = app.last_vantage_result.write().await;
            cache.insert(
                vantage_key(&user_id, payload.thread_id.as_deref(), payload.vantage_id.as_deref()),
                LastResult {
                    answer: answer.clone(),
                    memory_ids: vec![],
                    answer_id: Some(answer_id.to_string()),
                },
            );
        }
        write_answer_trace(
            &app,
            &user_id,
            payload.thread_id.as_deref(),
            &vid,
            &model_id,
            answer_id,
            &answer,
            &[],
        )
        .await;

        return Ok(Json(json!({
            "answer": answer,
            "answer_id": answer_id.to_string(),
            "meta_explanation": meta,
            "memory_used": if debug_on { json!([]) } else { JsonValue::Null },
            "system_prompt": if debug_on { json!("") } else { JsonValue::Null },
        })));
    }

    // Legacy greeting bypass.
    if app.config.vantage_greeting_bypass && is_pure_reentry_greeting(&payload.message) {
        let mut system_prompt = crate::api::rag::GREETING_SYSTEM_PROMPT.to_string();
        if !overlays.text.is_empty() {
            system_prompt = format!("{system_prompt}\n\n{}", overlays.text);
        }

        let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &[]).await;
        meta["model"] = json!({"id": model_id.clone()});
        meta["vantage"] = json!({
            "counts": {"k_memory": 0, "k_corpus": 0},
            "thread_context": thread_stats,
        });
        if debug_on {
            meta["vantage"]["sd"] = serde_json::to_value(&sd).unwrap_or_default();
            meta["vantage"]["decision"] = serde_json::to_value(&decision).unwrap_or_default();
            meta["vantage"]["pragmatics_path"] = json!("legacy_greeting_bypass");
        }

        if payload.inspect_only {
            return Ok(Json(json!({
                "answer": "",
                "meta_explanation": meta,
                "memory_used": [],
                "system_prompt": system_prompt,
            })));
        }

        let mut msgs = vec![ChatMessage::system(system_prompt.clone())];
        msgs.extend(thread_messages.clone());
        msgs.push(ChatMessage::user(payload.message.clone()));
        let answer = app
            .chat
            .chat(&msgs, &model_id)
            .await
            .map_err(|e| ApiError::upstream_unavailable(format!("chat failed: {e}")))?;

        let answer_id = Uuid::new_v4();
        {
            let mut cache = app.last_vantage_result.write().await;
            cache.insert(
                vantage_key(&user_id, payload.thread_id.as_deref(), payload.vantage_id.as_deref()),
                LastResult {
                    answer: answer.clone(),
                    memory_ids: vec![],
                    answer_id: Some(answer_id.to_string()),
                },
            );
        }
        write_answer_trace(
            &app,
            &user_id,
            payload.thread_id.as_deref(),
            &vid,
            &model_id,
            answer_id,
            &answer,
            &[],
        )
        .await;

        return Ok(Json(json!({
            "answer": answer,
            "answer_id": answer_id.to_string(),
            "meta_explanation": meta,
            "memory_used": if debug_on { json!([]) } else { JsonValue::Null },
            "system_prompt": if debug_on { json!(system_prompt) } else { JsonValue::Null },
        })));
    }

    // ---- normal retrieval path ----

    let retriever = app.retriever();

    let bias_map = if k_personal > 0 {
        match load_latest_vb_desire_profile(&app.vector, &user_id).await {
            Some(card) => vb_desire_bias_map(&card),
            None => HashMap::new(),
        }
    } else {
        HashMap::new()
    };

    let personal_hits = if k_personal > 0 {
        retriever
            .retrieve_personal_memory(&user_id, &payload.message, k_personal, thr_f, &vid, &bias_map)
            .await
    } else {
        Vec::new()
    };

    let corpus_hits = if k_corpus > 0 {
        let hits = retriever
            .unified_retrieve(&payload.message, k_corpus, thr_f, &vid)
            .await;
        apply_recency_bias(hits, recency_bias)
    } else {
        Vec::new()
    };

    // Combine + rank; personal hits carry their collection as the source
    // bucket so counts stay correct after sorting and trimming.
    let mut memory_chunks: Vec<Hit> = personal_hits;
    memory_chunks.extend(corpus_hits);
    memory_chunks
        .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    memory_chunks.truncate(base_k);

    let k_memory = memory_chunks
        .iter()
        .filter(|h| h.collection == crate::vector::MEMORY_COLLECTION)
        .count();
    let k_corpus_used = memory_chunks.len() - k_memory;

    // No persona injection on this path; only explicit user instructions.
    let system_prompt = build_system_prompt(
        &app.vector,
        &user_id,
        &memory_chunks,
        &overlays.text,
        &vid,
        PromptOptions { include_persona: false, ..PromptOptions::default() },
    )
    .await;

    let mut meta = build_meta_explanation(&app, &user_id, &payload.message, &memory_chunks).await;
    meta["model"] = json!({"id": model_id.clone()});
    meta["identity"] = json!({
        "vantage_id": vid.clone(),
        "user_id_alias": alias_uid.clone(),
        "canonical_user_id": user_id.clone(),
    });
    meta["vantage"] = json!({
        "counts": {"k_memory": k_memory, "k_corpus": k_corpus_used},
        "thread_context": thread_stats,
    });
    if debug_on {
        meta["vantage"]["sd"] = serde_json::to_value(&sd).unwrap_or_default();
        meta["vantage"]["limits"] = serde_json::to_value(limits).unwrap_or_default();
        meta["vantage"]["params"] = serde_json::to_value(&params).unwrap_or_default();
        meta["vantage"]["decision"] = serde_json::to_value(&decision).unwrap_or_default();
        meta["vantage"]["routing"] = payload.routing.clone().unwrap_or_default();
        meta["vantage"]["mix"] = mix.clone();
        meta["vantage"]["pragmatics"] = pr.clone();
        meta["vantage"]["pragmatics_path"] = json!("normal_path");
    }

    // Temporal re-entry line; never on CLARIFY turns.
    let mut reentry_prefix = String::new();
    if rc != ResponseClass::Clarify && app.config.vantage_reentry_prefix {
        let bucket = meta["temporal"]["bucket"].as_str().unwrap_or("unknown").to_string();
        let query_tags: Vec<String> = meta["query_tags"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default();
        if temporal::should_add_reentry_line(&bucket, &payload.message, &query_tags) {
            reentry_prefix = temporal::build_reentry_line(&bucket);
        }
    }

    if payload.inspect_only {
        return Ok(Json(json!({
            "answer": "",
            "meta_explanation": meta,
            "memory_used": if debug_on { json!(hits_json(&memory_chunks)) } else { json!([]) },
            "system_prompt": system_prompt,
        })));
    }

    let mut msgs = vec![ChatMessage::system(system_prompt.clone())];
    msgs.extend(thread_messages);
    msgs.push(ChatMessage::user(payload.message.clone()));
    let mut answer = app
        .chat
        .chat(&msgs, &model_id)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("chat failed: {e}")))?;

    if !reentry_prefix.is_empty() {
        answer = format!("{reentry_prefix}{answer}");
    }
    if rc == ResponseClass::Clarify && app.config.vantage_enforce_clarify_shape {
        answer = enforce_clarify_shape(&answer, mq);
    }

    let memory_ids = personal_memory_ids(&memory_chunks);

    let answer_id = Uuid::new_v4();
    {
        let mut cache = app.last_vantage_result.write().await;
        cache.insert(
            vantage_key(&user_id, payload.thread_id.as_deref(), payload.vantage_id.as_deref()),
            LastResult {
                answer: answer.clone(),
                memory_ids: memory_ids.clone(),
                answer_id: Some(answer_id.to_string()),
            },
        );
    }
    write_answer_trace(
        &app,
        &user_id,
        payload.thread_id.as_deref(),
        &vid,
        &model_id,
        answer_id,
        &answer,
        &memory_ids,
    )
    .await;

    info!(
        answer_id = %answer_id,
        response_class = rc.as_str(),
        k_memory,
        k_corpus = k_corpus_used,
        "vantage answer"
    );

    Ok(Json(json!({
        "answer": answer,
        "answer_id": answer_id.to_string(),
        "meta_explanation": meta,
        "memory_used": if debug_on { json!(hits_json(&memory_chunks)) } else { JsonValue::Null },
        "system_prompt": if debug_on { json!(system_prompt) } else { JsonValue::Null },
    })))
}

/// POST /vantage/feedback — answer_id-first durable lookup, then the
/// in-memory caches.
pub async fn vantage_feedback(
    State(app): State<Arc<AppState>>,
    Json(payload): Json<VantageFeedbackPayload>,
) -> ApiResult<Json<JsonValue>> {
    if !app.config.enable_vantage_endpoints {
        return Err(ApiError::not_found("not found"));
    }

    let user_id = {
        let u = payload.user_id.trim();
        if u.is_empty() { "anon".to_string() } else { u.to_string() }
    };
    let fb_text = payload.message.trim().to_string();
    if fb_text.is_empty() {
        return Ok(Json(json!({"status": "empty"})));
    }

    let key = vantage_key(&user_id, payload.thread_id.as_deref(), payload.vantage_id.as_deref());

    // Prefer the durable trace when an answer_id is provided.
    let mut last: Option<LastResult> = None;
    if let Some(aid) = payload.answer_id.as_deref().and_then(|a| Uuid::parse_str(a.trim()).ok()) {
        match sqlx::query(
            "SELECT answer_text, memory_ids FROM vantage_answer_trace
             WHERE answer_id=$1 AND user_id=$2",
        )
        .bind(aid)
        .bind(&user_id)
        .fetch_optional(&app.pool)
        .await
        {
            Ok(Some(row)) => {
                last = Some(LastResult {
                    answer: row.get::<String, _>("answer_text"),
                    memory_ids: row.get::<Option<Vec<String>>, _>("memory_ids").unwrap_or_default(),
                    answer_id: Some(aid.to_string()),
                });
            }
            Ok(None) => {}
            Err(e) => warn!("answer trace lookup failed: {}", e),
        }
    }

    if last.is_none() {
        let cache = app.last_vantage_result.read().await;
        last = cache
            .get(&key)
            .cloned()
            .or_else(|| {
                if key.1.is_empty() {
                    None
                } else {
                    cache
                        .get(&vantage_key(&user_id, None, payload.vantage_id.as_deref()))
                        .cloned()
                }
            })
            .or_else(|| cache.get(&vantage_key(&user_id, None, None)).cloned());
    }

    let Some(last) = last else {
        return Ok(Json(json!({"status": "no_last_answer"})));
    };

    let signal = classify_feedback(&app, &last.answer, &fb_text).await;
    let tag = extract_tag_from_message(&fb_text);

    if signal == "neutral" && tag.is_none() {
        return Ok(Json(json!({"status": "neutral"})));
    }

    let mut updated = 0usize;
    for mid in &last.memory_ids {
        match apply_memory_feedback(&app, &user_id, mid, &signal, tag.as_deref()).await {
            Ok(crate::api::retrieve::FeedbackOutcome::Updated { .. }) => updated += 1,
            Ok(_) => {}
            Err(e) => warn!(memory_id = %mid, "vantage feedback apply failed: {}", e),
        }
    }

    // Always refresh the style card, even when nothing was reinforced.
    let refresh = quick_persona_refresh(&app.vector, &app.embedder, &user_id, 100).await;
    info!(user_id = %user_id, status = %refresh["status"], "style card refresh");

    Ok(Json(json!({
        "status": "ok",
        "signal": signal,
        "tag": tag,
        "updated": updated,
        "note": if last.memory_ids.is_empty() { json!("no_memory_ids") } else { JsonValue::Null },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phatic_and_tasky_detection() {
        assert!(looks_phatic("hey there"));
        assert!(looks_phatic("thanks!"));
        assert!(!looks_phatic("the deploy failed"));
        assert!(!looks_phatic(""));

        assert!(looks_tasky("can you fix the build"));
        assert!(looks_tasky("explain this stack trace"));
        assert!(!looks_tasky("good morning"));
    }

    #[test]
    fn ritual_replies_scale_with_embodiment() {
        assert_eq!(ritual_reply("hey", 0), "Ready when you are. What's on your mind?");
        assert_eq!(ritual_reply("hey", 1), "All systems nominal. What's on your mind?");
        assert_eq!(ritual_reply("hey", 3), "I'm doing well. What's on your mind?");
        assert_eq!(ritual_reply("thanks a lot", 3), "You're welcome. What's on your mind?");
        assert_eq!(ritual_reply("thanks", 1), "No problem. What's on your mind?");
        assert_eq!(ritual_reply("sorry about that", 2), "No worries. What's on your mind?");
    }

    #[test]
    fn recency_bias_prefers_fresh_hits() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        let hits = vec![
            Hit {
                collection: "corpus".into(),
                id: "old".into(),
                score: 0.50,
                payload: json!({"created_at": old.to_rfc3339()}),
            },
            Hit {
                collection: "corpus".into(),
                id: "new".into(),
                score: 0.48,
                payload: json!({"created_at": now.to_rfc3339()}),
            },
        ];

        let ranked = apply_recency_bias(hits.clone(), 1.0);
        assert_eq!(ranked[0].id, "new");

        // Zero bias leaves order untouched.
        let unranked = apply_recency_bias(hits, 0.0);
        assert_eq!(unranked[0].id, "old");
    }

    #[test]
    fn recency_bias_is_bounded() {
        let hits = vec![Hit {
            collection: "corpus".into(),
            id: "x".into(),
            score: 0.0,
            payload: json!({"created_at": Utc::now().to_rfc3339()}),
        }];
        let ranked = apply_recency_bias(hits, 1.0);
        assert!(ranked[0].score <= 0.25 + f32::EPSILON);
    }

    #[test]
    fn routing_parses_and_clamps() {
        let r = routing_from(&Some(json!({
            "answer_first": false,
            "clarify_bias": 7.0,
            "max_clarify_questions": 99,
        })));
        assert!(!r.answer_first);
        assert_eq!(r.clarify_bias, 1.0);
        assert_eq!(r.max_clarify_questions, 3);

        let d = routing_from(&None);
        assert!(d.answer_first);
    }
}
