// src/persona.rs
// Persona loading and prompt composition: singleton identity/style/
// preference cards from memory_raw plus retrieved memory chunks become the
// system prompt. Also the lightweight style-card consolidation that runs on
// feedback.

use std::collections::HashSet;
use std::sync::Arc;

use qdrant_client::qdrant::Filter;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::identity::singleton_card_id;
use crate::llm::Embedder;
use crate::profiles::{now_iso, payload_feedback};
use crate::vector::{match_field, Hit, RetrievedPoint, VectorStore, MEMORY_COLLECTION};

pub const BASE_PERSONA: &str = "Respond in a way that is consistent with the user's past preferences, feedback,\nand memory. Do not assume personal details or emotions unless they are stated.\nAdapt your style through reinforcement over time.";

/// memory_card points for a user, scoped to the active vantage namespace
/// (legacy points without a vantage_id pass only for the default vantage).
async fn load_persona_points(
    store: &VectorStore,
    user_id: &str,
    vantage_id: &str,
) -> Vec<RetrievedPoint> {
    let vid = if vantage_id.trim().is_empty() { "default" } else { vantage_id.trim() };

    let filter = Filter::must([
        match_field("user_id", user_id),
        match_field("source", "memory_card"),
    ]);

    let points = match store.scroll(MEMORY_COLLECTION, Some(filter), 256, true).await {
        Ok(p) => p,
        Err(e) => {
            warn!(user_id = %user_id, "persona card load failed: {}", e);
            return Vec::new();
        }
    };

    points
        .into_iter()
        .filter(|p| {
            let pv = p.payload.get("vantage_id").and_then(|v| v.as_str()).unwrap_or("");
            pv == vid || (pv.is_empty() && vid == "default")
        })
        .collect()
}

/// Importance score for a persona card: base importance nudged by feedback.
fn score_persona_point(payload: &JsonValue) -> f64 {
    let base = payload
        .get("base_importance")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.7);
    let (pos, neg) = payload_feedback(payload);
    (base + 0.1 * (pos - neg) as f64).clamp(0.0, 1.5)
}

/// Up to `max_items` card texts of one kind, strongest first. Cards with an
/// explicit vantage_id outrank legacy ones regardless of score.
fn pick_top_text(points: &[RetrievedPoint], kind: &str, max_items: usize) -> Vec<String> {
    let mut filtered: Vec<&RetrievedPoint> = points
        .iter()
        .filter(|p| p.payload.get("kind").and_then(|v| v.as_str()) == Some(kind))
        .collect();

    filtered.sort_by(|a, b| {
        let key = |p: &RetrievedPoint| {
            let has_vid = p
                .payload
                .get("vantage_id")
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            let ts = p
                .payload
                .get("updated_at")
                .or_else(|| p.payload.get("created_at"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            (has_vid, score_persona_point(&p.payload), ts)
        };
        let (av, ascore, ats) = key(a);
        let (bv, bscore, bts) = key(b);
        bv.cmp(&av)
            .then(bscore.partial_cmp(&ascore).unwrap_or(std::cmp::Ordering::Equal))
            .then(bts.cmp(&ats))
    });

    filtered
        .into_iter()
        .take(max_items)
        .filter_map(|p| {
            p.payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .collect()
}

fn card_block(header: &str, texts: &[String]) -> Option<String> {
    if texts.is_empty() {
        return None;
    }
    let mut lines = vec![header.to_string()];
    lines.extend(texts.iter().map(|t| format!("- {t}")));
    Some(lines.join("\n"))
}

/// Just the global user-instructions block, for paths that suppress the full
/// persona but still apply explicit personalization.
pub async fn build_user_instructions_block(
    store: &VectorStore,
    user_id: &str,
    vantage_id: &str,
) -> String {
    let points = load_persona_points(store, user_id, vantage_id).await;
    let texts = pick_top_text(&points, "user_instructions", 1);
    match texts.first() {
        Some(txt) if !txt.is_empty() => format!("[USER INSTRUCTIONS — GLOBAL]\n{txt}"),
        _ => String::new(),
    }
}

/// Compose the full persona for a user: static base plus the strongest
/// identity, style, style-mode, preference, and instruction cards.
pub async fn build_persona_block(store: &VectorStore, user_id: &str, vantage_id: &str) -> String {
    let mut pieces: Vec<String> = vec![BASE_PERSONA.to_string()];
    let points = load_persona_points(store, user_id, vantage_id).await;
    if points.is_empty() {
        return BASE_PERSONA.to_string();
    }

    let sections: [(&str, &str, usize); 5] = [
        ("user_identity", "[User Identity]", 1),
        ("assistant_identity", "[Assistant Identity]", 1),
        ("style", "[User-Specific Style]", 3),
        ("style_mode", "[Style Modes]", 3),
        ("preference", "[User Preferences]", 5),
    ];
    for (kind, header, max_items) in sections {
        if let Some(block) = card_block(header, &pick_top_text(&points, kind, max_items)) {
            pieces.push(block);
        }
    }

    let instr = pick_top_text(&points, "user_instructions", 1);
    if let Some(txt) = instr.first() {
        if !txt.is_empty() {
            pieces.push(format!("[USER INSTRUCTIONS — GLOBAL]\n{txt}"));
        }
    }

    pieces
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render retrieved chunks as a compact bullet list, deduped by content
/// across collections while preserving provenance.
pub fn format_memory_chunks(chunks: &[Hit]) -> String {
    if chunks.is_empty() {
        return String::new();
    }

    struct Entry {
        text: String,
        sources: Vec<String>,
    }
    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, Entry> = std::collections::HashMap::new();

    for item in chunks {
        let payload = &item.payload;
        let coll = item.collection.trim();
        let kind = payload.get("kind").and_then(|v| v.as_str()).unwrap_or("").trim();

        let mut text = payload
            .get("text")
            .or_else(|| payload.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            let q = payload.get("question").and_then(|v| v.as_str()).unwrap_or("").trim();
            let a = payload.get("answer").and_then(|v| v.as_str()).unwrap_or("").trim();
            text = match (q.is_empty(), a.is_empty()) {
                (false, false) => format!("Q: {q}\nA: {a}"),
                (false, true) => format!("Q: {q}"),
                (true, false) => a.to_string(),
                (true, true) => String::new(),
            };
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            continue;
        }

        let mut prefix = format!("[{coll}]");
        if !kind.is_empty() {
            prefix.push_str(&format!("[{kind}]"));
        }

        let key = text.to_lowercase();
        match merged.get_mut(&key) {
            Some(entry) => {
                if !entry.sources.contains(&prefix) {
                    entry.sources.push(prefix);
                }
            }
            None => {
                order.push(key.clone());
                merged.insert(key, Entry { text, sources: vec![prefix] });
            }
        }
    }

    order
        .iter()
        .filter_map(|key| merged.get(key))
        .map(|entry| {
            let main = &entry.sources[0];
            let extra = if entry.sources.len() > 1 {
                format!(" (also: {})", entry.sources[1..].join(", "))
            } else {
                String::new()
            };
            format!("- {main} {}{extra}", entry.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct PromptOptions<'a> {
    pub include_persona: bool,
    pub include_memory: bool,
    pub memory_header: &'a str,
}

impl Default for PromptOptions<'_> {
    fn default() -> Self {
        Self {
            include_persona: true,
            include_memory: true,
            memory_header: "Relevant context from memory:",
        }
    }
}

/// Combine persona, request-scoped overlay text (never stored), and the
/// retrieved memory block into a single system prompt.
pub async fn build_system_prompt(
    store: &VectorStore,
    user_id: &str,
    memory_chunks: &[Hit],
    overlay_text: &str,
    vantage_id: &str,
    opts: PromptOptions<'_>,
) -> String {
    let mut pieces: Vec<String> = Vec::new();

    if opts.include_persona {
        let persona = build_persona_block(store, user_id, vantage_id).await;
        if !persona.trim().is_empty() {
            pieces.push(persona.trim().to_string());
        }
    }

    if !overlay_text.trim().is_empty() {
        pieces.push(overlay_text.trim().to_string());
    }

    if !opts.include_persona {
        let instr = build_user_instructions_block(store, user_id, vantage_id).await;
        if !instr.trim().is_empty() {
            pieces.push(instr.trim().to_string());
        }
    }

    if opts.include_memory {
        let memory_block = format_memory_chunks(memory_chunks);
        if !memory_block.trim().is_empty() {
            pieces.push(format!("{}\n{}", opts.memory_header, memory_block.trim()));
        }
    }

    let mut out = pieces.join("\n\n").trim().to_string();
    out.push('\n');
    out
}

/// Surface-level style preferences detectable from raw messages.
pub fn detect_style_preferences(texts: &[String]) -> Vec<&'static str> {
    let lower: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
    let any = |needles: &[&str]| lower.iter().any(|t| needles.iter().any(|n| t.contains(n)));

    let mut lines = Vec::new();
    if any(&["too long", "shorter"]) {
        lines.push("Prefers short, dense responses.");
    }
    if any(&["no bullet", "no lists"]) {
        lines.push("Dislikes bullet points and lists; prefers flowing paragraphs.");
    }
    if any(&["more concrete"]) {
        lines.push("Prefers concrete examples and applications.");
    }
    if any(&["more philosophy"]) {
        lines.push("Prefers more philosophical framing.");
    }
    if any(&["less philosophy"]) {
        lines.push("Prefers minimal philosophical framing.");
    }
    lines
}

const BASELINE_STYLE: &str = "Prefers short, dense responses. Dislikes bullet points and lists; prefers flowing paragraphs. Prefers concrete examples and applications.";

/// Look at the user's recent raw messages, extract obvious style
/// preferences, and update the deterministic `style` singleton card. When
/// nothing is detected, self-heal a missing baseline card.
pub async fn quick_persona_refresh(
    store: &VectorStore,
    embedder: &Arc<dyn Embedder>,
    user_id: &str,
    limit: usize,
) -> JsonValue {
    let filter = Filter::must([match_field("user_id", user_id)]);
    let points = match store.scroll(MEMORY_COLLECTION, Some(filter), limit, true).await {
        Ok(p) => p,
        Err(e) => {
            warn!(user_id = %user_id, "quick_persona_refresh scroll failed: {}", e);
            return json!({"status": "qdrant_error", "detail": e.to_string()});
        }
    };

    let texts: Vec<String> = points
        .iter()
        .filter_map(|p| p.payload.get("text").and_then(|v| v.as_str()))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let preference_lines = detect_style_preferences(&texts);
    let card_id = singleton_card_id(user_id, "style", "__singleton__").to_string();

    let text_block = if preference_lines.is_empty() {
        // Self-heal: recreate the baseline style card if it is missing.
        let existing = store
            .retrieve(MEMORY_COLLECTION, &[card_id.clone()], false)
            .await
            .unwrap_or_default();
        if !existing.is_empty() {
            return json!({"status": "no_changes"});
        }
        BASELINE_STYLE.to_string()
    } else {
        preference_lines.join(" ")
    };

    let now = now_iso();
    let card = json!({
        "user_id": user_id,
        "text": text_block,
        "source": "memory_card",
        "tags": ["summary", "card", "style"],
        "kind": "style",
        "base_importance": 0.7,
        "created_at": now,
        "updated_at": now,
        "topic_key": "__singleton__",
    });

    let vector = match embedder.embed(&text_block).await {
        Ok(v) => v,
        Err(e) => {
            warn!(user_id = %user_id, "quick_persona_refresh embed failed: {}", e);
            return json!({"status": "embed_error", "detail": e.to_string()});
        }
    };

    match store.upsert(MEMORY_COLLECTION, &card_id, vector, &card).await {
        Ok(()) => {
            if preference_lines.is_empty() {
                json!({"status": "recreated_baseline", "card_id": card_id})
            } else {
                json!({"status": "updated", "card": card})
            }
        }
        Err(e) => {
            warn!(user_id = %user_id, "quick_persona_refresh upsert failed: {}", e);
            json!({"status": "qdrant_upsert_error", "detail": e.to_string()})
        }
    }
}

/// Identity/policy queries are answered from the persona cards alone;
/// retrieval would only add noise. Keep the phrase list narrow.
pub fn is_identity_or_policy_query(message: &str) -> bool {
    let m = message.trim().to_lowercase();
    if m.is_empty() {
        return false;
    }

    const PHRASES: &[&str] = &[
        "preferred response style",
        "style modes",
        "interaction contract",
        "infra roles",
        "project mission",
        "our project mission",
        "our mission",
        "user preferences",
        "assistant identity",
        "user identity",
        "what is my name",
        "what's my name",
        "who am i",
        "what is your name",
        "what's your name",
        "who are you",
    ];
    if PHRASES.iter().any(|p| m.contains(p)) {
        return true;
    }

    static STYLE_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"what(?:'s| is) my preferred response style").unwrap()
    });
    static MISSION_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"what(?:'s| is) (our|the) project mission").unwrap()
    });
    STYLE_RE.is_match(&m) || MISSION_RE.is_match(&m)
}

/// True when the message is basically a greeting / re-entry with no task.
pub fn is_pure_reentry_greeting(message: &str) -> bool {
    let msg = message.trim().to_lowercase();
    if msg.is_empty() || msg.len() > 40 {
        return false;
    }

    static GREETING_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^(hey|hi|hello|yo)\b").unwrap());

    let greeting_start = GREETING_RE.is_match(&msg)
        || msg.starts_with("i'm back")
        || msg.starts_with("im back")
        || msg.starts_with("back again");
    if !greeting_start {
        return false;
    }

    const REQUEST_MARKERS: &[&str] = &[
        "give me", "show me", "help me", "explain", "how do", "steps",
        "outline", "bulleted", "write", "generate", "tell me",
    ];
    !REQUEST_MARKERS.iter().any(|m| msg.contains(m))
}

/// Extract an explicit tag from "tag this as ..." feedback. Returns a slug.
pub fn extract_tag_from_message(text: &str) -> Option<String> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    static TAG_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\btag this(?: as)?\s+(.+)").unwrap());
    static SLUG_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"[^a-z0-9]+").unwrap());

    let raw = TAG_RE.captures(&lowered)?.get(1)?.as_str();
    // Stop at the first sentence break.
    let raw = raw
        .split(['.', '!', '?', ','])
        .next()
        .unwrap_or("")
        .trim();

    let slug = SLUG_RE.replace_all(raw, "_").trim_matches('_').to_string();
    if slug.is_empty() { None } else { Some(slug) }
}

/// Sentiment markers for feedback classification; the model fallback only
/// runs when these stay neutral.
pub fn classify_feedback_markers(user_message: &str) -> Option<&'static str> {
    let text = user_message.trim().to_lowercase();
    if text.is_empty() {
        return Some("neutral");
    }

    const NEGATIVE: &[&str] = &[
        "that wasn't helpful",
        "that wasnt helpful",
        "not helpful",
        "that is wrong",
        "that's wrong",
        "you are wrong",
        "this is wrong",
        "that missed the point",
        "you missed the point",
        "i don't like that answer",
        "i do not like that answer",
    ];
    if NEGATIVE.iter().any(|m| text.contains(m)) {
        return Some("negative");
    }

    const POSITIVE: &[&str] = &[
        "that was helpful",
        "this was helpful",
        "that is helpful",
        "that's helpful",
        "exactly right",
        "that's perfect",
        "perfect, thank you",
        "this is good",
        "that is good",
        "this is exactly what i meant",
        "that is exactly what i meant",
    ];
    if POSITIVE.iter().any(|m| text.contains(m)) {
        return Some("positive");
    }

    None
}

/// Set of personal-memory ids present in a chunk list (payload and top-level
/// id keys both accepted).
pub fn personal_memory_ids(chunks: &[Hit]) -> Vec<String> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|h| h.collection == MEMORY_COLLECTION)
        .filter_map(|h| {
            if !h.id.is_empty() {
                Some(h.id.clone())
            } else {
                h.payload
                    .get("id")
                    .or_else(|| h.payload.get("memory_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }
        })
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(coll: &str, text: &str, kind: &str) -> Hit {
        Hit {
            collection: coll.to_string(),
            id: format!("{coll}:{text}"),
            score: 0.5,
            payload: json!({"text": text, "kind": kind}),
        }
    }

    #[test]
    fn memory_chunks_dedupe_across_collections() {
        let chunks = vec![
            hit("memory_raw", "The user lifts on Mondays.", "chat"),
            hit("workout_db", "The user lifts on Mondays.", "fact"),
            hit("workout_db", "Hammer strength row, 3x8.", ""),
        ];
        let block = format_memory_chunks(&chunks);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[memory_raw][chat]"));
        assert!(lines[0].contains("(also: [workout_db][fact])"));
        assert!(lines[1].starts_with("- [workout_db] Hammer strength row"));
    }

    #[test]
    fn question_answer_payloads_render() {
        let h = Hit {
            collection: "faq".into(),
            id: "1".into(),
            score: 0.4,
            payload: json!({"question": "Why decay?", "answer": "Strength fades."}),
        };
        let block = format_memory_chunks(&[h]);
        assert!(block.contains("Q: Why decay?"));
        assert!(block.contains("A: Strength fades."));
    }

    #[test]
    fn identity_policy_queries_match_narrowly() {
        assert!(is_identity_or_policy_query("What is my name?"));
        assert!(is_identity_or_policy_query("tell me about my user preferences"));
        assert!(is_identity_or_policy_query("what's my preferred response style"));
        assert!(!is_identity_or_policy_query("my writing style needs work"));
        assert!(!is_identity_or_policy_query(""));
    }

    #[test]
    fn greeting_detection() {
        assert!(is_pure_reentry_greeting("hey, i'm back"));
        assert!(is_pure_reentry_greeting("hello"));
        assert!(!is_pure_reentry_greeting("hey, explain the decay curve"));
        assert!(!is_pure_reentry_greeting("this is important"));
        assert!(!is_pure_reentry_greeting(
            "hey there, i have a very long message that rambles on and on"
        ));
    }

    #[test]
    fn tag_extraction_slugs() {
        assert_eq!(
            extract_tag_from_message("that was helpful, tag this as fm expansion"),
            Some("fm_expansion".to_string())
        );
        assert_eq!(
            extract_tag_from_message("Tag this as Fractal Monism Expansion. Thanks!"),
            Some("fractal_monism_expansion".to_string())
        );
        assert_eq!(extract_tag_from_message("no tags here"), None);
        assert_eq!(extract_tag_from_message("tag this as ???"), None);
    }

    #[test]
    fn feedback_markers_classify() {
        assert_eq!(classify_feedback_markers("that was helpful!"), Some("positive"));
        assert_eq!(classify_feedback_markers("that missed the point"), Some("negative"));
        assert_eq!(classify_feedback_markers("interesting"), None);
        assert_eq!(classify_feedback_markers("  "), Some("neutral"));
    }

    #[test]
    fn style_preferences_detected_from_texts() {
        let texts = vec![
            "that was too long".to_string(),
            "no bullets please".to_string(),
        ];
        let lines = detect_style_preferences(&texts);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("short"));

        assert!(detect_style_preferences(&["fine".to_string()]).is_empty());
    }

    #[test]
    fn personal_ids_only_from_memory_collection() {
        let chunks = vec![
            hit("memory_raw", "a", ""),
            hit("corpus", "b", ""),
            hit("memory_raw", "a", ""),
        ];
        let ids = personal_memory_ids(&chunks);
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("memory_raw:"));
    }
}
