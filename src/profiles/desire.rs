// src/profiles/desire.rs
// VB desire profile: per-tag request patterns with feedback-smoothed scores,
// consolidated into a vb_desire_profile singleton card.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use qdrant_client::qdrant::Filter;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::identity::singleton_card_id;
use crate::llm::Embedder;
use crate::profiles::{now_iso, payload_feedback, payload_tags};
use crate::vector::{match_field, VectorStore, MEMORY_COLLECTION};

#[derive(Debug, Clone, Default)]
struct Bucket {
    count: f64,
    pos: f64,
    neg: f64,
}

/// Smoothed score in (-1, +1): positive means reinforced, negative punished.
/// The +2 smoothing keeps small samples from pinning to the extremes; with
/// large asymmetric counts the score can still approach ±1, which is
/// intended.
fn score_bucket(count: f64, pos: f64, neg: f64) -> f64 {
    (pos - neg) / (count + 2.0).max(2.0)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BucketRow {
    pub key: String,
    pub count: i64,
    pub positive_feedback: i64,
    pub negative_feedback: i64,
    pub score: f64,
}

fn top_n(buckets: &HashMap<String, Bucket>, n: usize) -> Vec<BucketRow> {
    let mut rows: Vec<BucketRow> = buckets
        .iter()
        .map(|(k, v)| BucketRow {
            key: k.clone(),
            count: v.count as i64,
            positive_feedback: v.pos as i64,
            negative_feedback: v.neg as i64,
            score: (score_bucket(v.count, v.pos, v.neg) * 10_000.0).round() / 10_000.0,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.count.cmp(&a.count))
    });
    rows.truncate(n);
    rows
}

fn infer_preferences(
    intent_rows: &[BucketRow],
    format_rows: &[BucketRow],
    topic_rows: &[BucketRow],
) -> JsonValue {
    let preferred_format_default = format_rows
        .first()
        .map(|r| {
            r.key
                .split_once(':')
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| r.key.clone())
        })
        .unwrap_or_else(|| "unspecified".to_string());

    let mut preferred_answer_length = "unspecified";
    let mut preferred_density = "unspecified";
    let mut avoidances: Vec<String> = Vec::new();

    for r in intent_rows {
        if r.key == "intent:summarize" && r.score > 0.0 {
            preferred_answer_length = "short";
        }
        if r.key == "intent:analyze" && r.score > 0.0 {
            preferred_density = "high";
        }
        if r.score < -0.1 {
            avoidances.push(r.key.clone());
        }
    }
    avoidances.truncate(5);

    let mut overrides = serde_json::Map::new();
    for t in topic_rows {
        if t.key == "topic:workout" && preferred_format_default == "skeleton" {
            overrides.insert("workout".to_string(), json!("skeleton"));
        }
    }

    json!({
        "preferred_answer_length": preferred_answer_length,
        "preferred_density": preferred_density,
        "preferred_format_default": preferred_format_default,
        "preferred_format_overrides": overrides,
        "avoidances": avoidances,
    })
}

/// Pure profile build from memory payloads; the card's identity fields are
/// stamped by the writer.
pub fn build_profile_payload(user_id: &str, memories: &[JsonValue], sample_limit: usize) -> JsonValue {
    let mut intent_buckets: HashMap<String, Bucket> = HashMap::new();
    let mut format_buckets: HashMap<String, Bucket> = HashMap::new();
    let mut topic_buckets: HashMap<String, Bucket> = HashMap::new();

    let mut total_utterances = 0i64;
    let mut total_feedback_events = 0i64;

    for payload in memories {
        let tags = payload_tags(payload);
        let (pos, neg) = payload_feedback(payload);
        if pos != 0 || neg != 0 {
            total_feedback_events += pos + neg;
        }
        total_utterances += 1;

        for t in &tags {
            let bucket = if t.starts_with("intent:") {
                &mut intent_buckets
            } else if t.starts_with("format:") {
                &mut format_buckets
            } else if t.starts_with("topic:") {
                &mut topic_buckets
            } else {
                continue;
            };
            let entry = bucket.entry(t.clone()).or_default();
            entry.count += 1.0;
            entry.pos += pos as f64;
            entry.neg += neg as f64;
        }
    }

    let intents_top = top_n(&intent_buckets, 5);
    let formats_top = top_n(&format_buckets, 5);
    let topics_top = top_n(&topic_buckets, 5);

    let inferred = infer_preferences(&intents_top, &formats_top, &topics_top);
    let now = now_iso();

    json!({
        "kind": "vb_desire_profile",
        "topic_key": "__singleton__",
        "user_id": user_id,
        "tags": ["card", "vb_profile", "desire"],
        "source_stats": {
            "total_utterances": total_utterances,
            "total_feedback_events": total_feedback_events,
            "sample_limit": sample_limit,
        },
        "request_patterns": {
            "by_intent": intents_top,
            "by_format": formats_top,
            "by_topic": topics_top,
        },
        "inferred_preferences": inferred,
        "created_at": now,
        "updated_at": now,
        "source": "vb_desire_daemon",
        "text": format!("VB desire profile for {user_id}"),
    })
}

/// Scroll the user's memory slice and build the profile card payload.
pub async fn build_vb_desire_profile(
    store: &VectorStore,
    user_id: &str,
    limit: usize,
) -> JsonValue {
    let filter = Filter::must([match_field("user_id", user_id)]);
    let memories: Vec<JsonValue> = match store
        .scroll(MEMORY_COLLECTION, Some(filter), limit, true)
        .await
    {
        Ok(points) => points.into_iter().map(|p| p.payload).collect(),
        Err(e) => {
            warn!(user_id = %user_id, "vb_desire: scroll failed: {}", e);
            Vec::new()
        }
    };
    build_profile_payload(user_id, &memories, limit)
}

async fn dedupe_profile(store: &VectorStore, user_id: &str, keep_id: &str) -> usize {
    let filter = Filter::must([
        match_field("user_id", user_id),
        match_field("kind", "vb_desire_profile"),
    ]);
    let points = match store.scroll(MEMORY_COLLECTION, Some(filter), 256, false).await {
        Ok(p) => p,
        Err(e) => {
            warn!("vb_desire: dedupe scroll failed: {}", e);
            return 0;
        }
    };

    let legacy: Vec<String> = points
        .into_iter()
        .map(|p| p.id)
        .filter(|id| id != keep_id)
        .collect();
    if legacy.is_empty() {
        return 0;
    }
    match store.delete_points(MEMORY_COLLECTION, &legacy).await {
        Ok(()) => legacy.len(),
        Err(e) => {
            warn!("vb_desire: dedupe delete failed: {}", e);
            0
        }
    }
}

/// Upsert the vb_desire_profile singleton and prune legacy duplicates.
/// Preserves created_at when the singleton already exists.
pub async fn write_vb_desire_profile_card(
    store: &VectorStore,
    embedder: &Arc<dyn Embedder>,
    user_id: &str,
    card: &JsonValue,
) -> Result<()> {
    let now = now_iso();
    let keep_id = singleton_card_id(user_id, "vb_desire_profile", "__singleton__").to_string();

    let created_at = store
        .retrieve(MEMORY_COLLECTION, &[keep_id.clone()], false)
        .await
        .ok()
        .and_then(|points| {
            points
                .first()
                .and_then(|p| p.payload.get("created_at"))
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| now.clone());

    let mut payload = card.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("kind".into(), json!("vb_desire_profile"));
        obj.insert("topic_key".into(), json!("__singleton__"));
        obj.insert("user_id".into(), json!(user_id));
        obj.insert("created_at".into(), json!(created_at));
        obj.insert("updated_at".into(), json!(now));
        obj.entry("source").or_insert_with(|| json!("vb_desire_daemon"));
        obj.entry("text")
            .or_insert_with(|| json!(format!("VB desire profile for {user_id}")));
    }

    let text = payload
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("vb_desire_profile")
        .to_string();

    let vector = embedder.embed(&text).await?;
    store.upsert(MEMORY_COLLECTION, &keep_id, vector, &payload).await?;

    let deleted = dedupe_profile(store, user_id, &keep_id).await;
    if deleted > 0 {
        info!(user_id = %user_id, deleted, "vb_desire: pruned legacy profile points");
    }
    Ok(())
}

/// Load the profile: deterministic singleton first, newest legacy duplicate
/// as a fallback (no deletes on the read path).
pub async fn load_latest_vb_desire_profile(
    store: &VectorStore,
    user_id: &str,
) -> Option<JsonValue> {
    let keep_id = singleton_card_id(user_id, "vb_desire_profile", "__singleton__").to_string();

    if let Ok(points) = store.retrieve(MEMORY_COLLECTION, &[keep_id], false).await {
        if let Some(p) = points.into_iter().next() {
            return Some(p.payload);
        }
    }

    let filter = Filter::must([
        match_field("user_id", user_id),
        match_field("kind", "vb_desire_profile"),
    ]);
    let mut points = store
        .scroll(MEMORY_COLLECTION, Some(filter), 256, true)
        .await
        .ok()?;
    if points.is_empty() {
        return None;
    }

    points.sort_by_key(|p| {
        p.payload
            .get("updated_at")
            .or_else(|| p.payload.get("created_at"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    });
    points.pop().map(|p| p.payload)
}

/// Per-tag retrieval nudges from the profile's request patterns.
/// Format 0.12, topic 0.10, intent 0.06 per unit of score; clamped to ±0.25.
pub fn vb_desire_bias_map(card: &JsonValue) -> HashMap<String, f64> {
    let mut bias: HashMap<String, f64> = HashMap::new();

    let rp = card.get("request_patterns");
    let rows = ["by_intent", "by_format", "by_topic"]
        .iter()
        .filter_map(|k| rp.and_then(|r| r.get(*k)).and_then(|v| v.as_array()))
        .flatten();

    for r in rows {
        let Some(key) = r.get("key").and_then(|v| v.as_str()) else { continue };
        let s = r
            .get("score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(-1.0, 1.0);

        let nudge = if key.starts_with("format:") {
            0.12 * s
        } else if key.starts_with("topic:") {
            0.10 * s
        } else if key.starts_with("intent:") {
            0.06 * s
        } else {
            continue;
        };
        *bias.entry(key.to_string()).or_insert(0.0) += nudge;
    }

    for v in bias.values_mut() {
        *v = v.clamp(-0.25, 0.25);
    }
    bias
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mem(tags: &[&str], pos: i64, neg: i64) -> JsonValue {
        json!({
            "tags": tags,
            "feedback": {"positive_signals": pos, "negative_signals": neg},
        })
    }

    #[test]
    fn smoothing_keeps_small_samples_moderate() {
        assert_eq!(score_bucket(1.0, 1.0, 0.0), 1.0 / 3.0);
        assert_eq!(score_bucket(0.0, 0.0, 0.0), 0.0);
        // Large asymmetric counts approach +1 by design.
        assert!(score_bucket(1000.0, 1000.0, 0.0) > 0.99);
    }

    #[test]
    fn profile_ranks_reinforced_buckets_first() {
        let memories = vec![
            mem(&["intent:summarize"], 3, 0),
            mem(&["intent:analyze"], 0, 2),
            mem(&["format:skeleton"], 2, 0),
        ];
        let card = build_profile_payload("kea", &memories, 5000);

        let intents = card["request_patterns"]["by_intent"].as_array().unwrap();
        assert_eq!(intents[0]["key"], "intent:summarize");
        assert!(intents[0]["score"].as_f64().unwrap() > 0.0);
        assert!(intents[1]["score"].as_f64().unwrap() < 0.0);

        let inferred = &card["inferred_preferences"];
        assert_eq!(inferred["preferred_answer_length"], "short");
        assert_eq!(inferred["preferred_format_default"], "skeleton");
        let avoid = inferred["avoidances"].as_array().unwrap();
        assert!(avoid.iter().any(|v| v == "intent:analyze"));
    }

    #[test]
    fn workout_override_applies_when_skeleton_preferred() {
        let memories = vec![
            mem(&["format:skeleton"], 3, 0),
            mem(&["topic:workout"], 1, 0),
        ];
        let card = build_profile_payload("kea", &memories, 100);
        assert_eq!(
            card["inferred_preferences"]["preferred_format_overrides"]["workout"],
            "skeleton"
        );
    }

    #[test]
    fn bias_map_scales_by_tag_family() {
        let card = json!({
            "request_patterns": {
                "by_intent": [{"key": "intent:analyze", "score": 0.5}],
                "by_format": [{"key": "format:prose", "score": 1.0}],
                "by_topic": [{"key": "topic:fm", "score": -1.0}],
            }
        });
        let bias = vb_desire_bias_map(&card);
        assert!((bias["intent:analyze"] - 0.03).abs() < 1e-9);
        assert!((bias["format:prose"] - 0.12).abs() < 1e-9);
        assert!((bias["topic:fm"] + 0.10).abs() < 1e-9);
    }

    #[test]
    fn bias_map_clamps_extremes() {
        // Scores above 1 are clamped before scaling, so the format nudge
        // cannot exceed 0.12 per row and ±0.25 overall.
        let card = json!({
            "request_patterns": {
                "by_format": [
                    {"key": "format:prose", "score": 5.0},
                    {"key": "format:prose", "score": 5.0},
                    {"key": "format:prose", "score": 5.0},
                ],
            }
        });
        let bias = vb_desire_bias_map(&card);
        assert!((bias["format:prose"] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn source_stats_count_utterances_and_feedback() {
        let memories = vec![mem(&["intent:explain"], 1, 1), mem(&[], 0, 0)];
        let card = build_profile_payload("kea", &memories, 100);
        assert_eq!(card["source_stats"]["total_utterances"], 2);
        assert_eq!(card["source_stats"]["total_feedback_events"], 2);
    }
}
