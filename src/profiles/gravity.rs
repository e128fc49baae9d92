// src/profiles/gravity.rs
// Gravity profile: a tag -> weight map summarizing a user's long-term
// behavioral tendencies, assembled from three sources with fixed mix
// weights (identity core 55%, reinforced patterns 30%, recent statistical
// behavior 15%) and clamped to [-1, 1].

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

/// All memory_raw payloads for a user.
pub async fn load_user_memories(store: &VectorStore, user_id: &str) -> Vec<JsonValue> {
    let filter = Filter::must([match_field("user_id", user_id)]);
    match store.scroll(MEMORY_COLLECTION, Some(filter), 20_000, true).await {
        Ok(points) => points.into_iter().map(|p| p.payload).collect(),
        Err(e) => {
            warn!(user_id = %user_id, "gravity: load_user_memories failed: {}", e);
            Vec::new()
        }
    }
}

/// Load the stored gravity_profile singleton weights, or empty when absent.
pub async fn load_gravity_profile(store: &VectorStore, user_id: &str) -> HashMap<String, f64> {
    let rec_id = singleton_card_id(user_id, "gravity_profile", "__singleton__").to_string();
    let points = match store.retrieve(MEMORY_COLLECTION, &[rec_id], false).await {
        Ok(p) => p,
        Err(e) => {
            warn!(user_id = %user_id, "gravity: profile retrieve failed: {}", e);
            return HashMap::new();
        }
    };

    points
        .first()
        .and_then(|p| p.payload.get("weights"))
        .and_then(|w| w.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

fn extract_style_mode_signals(memories: &[JsonValue]) -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    for mem in memories {
        if mem.get("kind").and_then(|v| v.as_str()) != Some("style_mode") {
            continue;
        }
        for t in payload_tags(mem) {
            *weights.entry(t).or_insert(0.0) += 0.6;
        }
    }
    weights
}

fn extract_preference_signals(memories: &[JsonValue]) -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    for mem in memories {
        let kind = mem.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if !matches!(kind, "user_preference" | "assistant_identity" | "preference") {
            continue;
        }
        for t in payload_tags(mem) {
            *weights.entry(t).or_insert(0.0) += 0.4;
        }
    }
    weights
}

fn extract_longterm_vb_signals(memories: &[JsonValue]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for mem in memories {
        for t in payload_tags(mem) {
            if t.starts_with("vb_ontology:") || t.starts_with("vb_stance:") {
                *counts.entry(t).or_insert(0) += 1;
            }
        }
    }

    let mut weights = HashMap::new();
    for (t, c) in counts {
        if t.starts_with("vb_ontology:") {
            weights.insert(t, (0.1 * c as f64).min(0.5));
        } else {
            weights.insert(t, (0.05 * c as f64).min(0.3));
        }
    }
    weights
}

fn extract_longterm_tag_frequencies(memories: &[JsonValue]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    for mem in memories {
        for t in payload_tags(mem) {
            *counts.entry(t).or_insert(0) += 1;
            total += 1;
        }
    }
    if total == 0 {
        return HashMap::new();
    }
    counts
        .into_iter()
        .map(|(t, c)| (t, (c as f64 / total as f64) * 0.2))
        .collect()
}

fn extract_reinforced_patterns(memories: &[JsonValue]) -> HashMap<String, f64> {
    let mut weights: HashMap<String, f64> = HashMap::new();

    for mem in memories {
        let tags = payload_tags(mem);
        let (pos, neg) = payload_feedback(mem);

        if pos != 0 || neg != 0 {
            let delta = 0.05 * (pos - neg) as f64;
            for t in &tags {
                *weights.entry(t.clone()).or_insert(0.0) += delta;
            }
        }

        for t in &tags {
            if t.starts_with("vb_desire:") {
                *weights.entry(t.clone()).or_insert(0.0) += 0.08;
            }
        }
    }

    for w in weights.values_mut() {
        *w = w.clamp(-0.3, 0.3);
    }
    weights
}

fn extract_statistical_behavior(memories: &[JsonValue]) -> HashMap<String, f64> {
    if memories.is_empty() {
        return HashMap::new();
    }
    let recent = if memories.len() > 200 {
        &memories[memories.len() - 200..]
    } else {
        memories
    };

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    for mem in recent {
        for t in payload_tags(mem) {
            *counts.entry(t).or_insert(0) += 1;
            total += 1;
        }
    }
    if total == 0 {
        return HashMap::new();
    }
    counts
        .into_iter()
        .map(|(t, c)| (t, (c as f64 / total as f64) * 0.15))
        .collect()
}

/// Pure aggregation: memory payloads in, tag weights out. Deterministic for
/// a given payload list.
pub fn aggregate_gravity(memories: &[JsonValue]) -> HashMap<String, f64> {
    // Identity core: later extractors override shared tags (strongest signal
    // for a tag is the last family that claims it).
    let mut identity_core = extract_style_mode_signals(memories);
    identity_core.extend(extract_preference_signals(memories));
    identity_core.extend(extract_longterm_vb_signals(memories));
    identity_core.extend(extract_longterm_tag_frequencies(memories));

    let reinforced = extract_reinforced_patterns(memories);
    let stat_behavior = extract_statistical_behavior(memories);

    let mut gravity: HashMap<String, f64> = HashMap::new();
    for (tag_map, factor) in [
        (&identity_core, 0.55),
        (&reinforced, 0.30),
        (&stat_behavior, 0.15),
    ] {
        for (tag, value) in tag_map {
            *gravity.entry(tag.clone()).or_insert(0.0) += value * factor;
        }
    }

    for w in gravity.values_mut() {
        *w = w.clamp(-1.0, 1.0);
    }
    gravity
}

/// Misalignment between the query's tags and the gravity profile.
/// 0.0 aligned / no profile, 0.3 no overlap, else the fraction of
/// overlapping tags whose weight is non-positive.
pub fn compute_misalignment(query_tags: &[String], gravity: &HashMap<String, f64>) -> f64 {
    if gravity.is_empty() || query_tags.is_empty() {
        return 0.0;
    }
    let overlap: Vec<&String> = query_tags.iter().filter(|t| gravity.contains_key(*t)).collect();
    if overlap.is_empty() {
        return 0.3;
    }
    let misaligned = overlap
        .iter()
        .filter(|t| gravity.get(**t).copied().unwrap_or(0.0) <= 0.0)
        .count();
    (misaligned as f64 / overlap.len() as f64).clamp(0.0, 1.0)
}

/// Full rebuild: scroll memories, aggregate, write the singleton card.
pub async fn compute_gravity(store: &VectorStore, user_id: &str) -> HashMap<String, f64> {
    let memories = load_user_memories(store, user_id).await;
    aggregate_gravity(&memories)
}

async fn dedupe_gravity_profile(store: &VectorStore, user_id: &str, keep_id: &str) -> usize {
    let filter = Filter::must([
        match_field("user_id", user_id),
        match_field("kind", "gravity_profile"),
    ]);
    let points = match store.scroll(MEMORY_COLLECTION, Some(filter), 256, false).await {
        Ok(p) => p,
        Err(e) => {
            warn!("gravity: dedupe scroll failed: {}", e);
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
            warn!("gravity: dedupe delete failed: {}", e);
            0
        }
    }
}

/// Write or update the gravity_profile singleton, then prune duplicates to
/// the deterministic id.
pub async fn write_gravity_card(
    store: &VectorStore,
    embedder: &Arc<dyn Embedder>,
    user_id: &str,
    gravity: &HashMap<String, f64>,
) -> Result<()> {
    let now = now_iso();
    let rec_id = singleton_card_id(user_id, "gravity_profile", "__singleton__").to_string();

    // Preserve created_at when the singleton already exists.
    let created = store
        .retrieve(MEMORY_COLLECTION, &[rec_id.clone()], false)
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

    let text = format!("Gravity profile for {user_id}");
    let payload = json!({
        "kind": "gravity_profile",
        "topic_key": "__singleton__",
        "user_id": user_id,
        "weights": gravity,
        "tags": ["gravity", "system"],
        "base_importance": 1.0,
        "created_at": created,
        "updated_at": now,
        "source": "gravity_daemon",
        "text": text,
    });

    let vector = embedder.embed(&text).await?;
    store.upsert(MEMORY_COLLECTION, &rec_id, vector, &payload).await?;

    let deleted = dedupe_gravity_profile(store, user_id, &rec_id).await;
    if deleted > 0 {
        info!(user_id = %user_id, deleted, "gravity: pruned legacy profile points");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mem(kind: &str, tags: &[&str]) -> JsonValue {
        json!({"kind": kind, "tags": tags})
    }

    #[test]
    fn style_mode_dominates_identity_core() {
        let memories = vec![mem("style_mode", &["format:prose"])];
        let g = aggregate_gravity(&memories);
        // style_mode gives 0.6, but the tag-frequency pass overrides it in
        // the identity core (single tag => freq 1.0 * 0.2). The recent
        // statistical pass sees the same tag at frequency 1.0 * 0.15.
        let w = g.get("format:prose").copied().unwrap();
        let expected = 0.2 * 0.55 + 0.15 * 0.15;
        assert!((w - expected).abs() < 1e-9, "w={w} expected={expected}");
    }

    #[test]
    fn feedback_reinforces_tags() {
        let memories = vec![json!({
            "kind": "chat",
            "tags": ["topic:fm"],
            "feedback": {"positive_signals": 4, "negative_signals": 1},
        })];
        let g = aggregate_gravity(&memories);
        let w = g.get("topic:fm").copied().unwrap();
        // identity core tag-frequency: 0.2*0.55; reinforced: 0.05*3=0.15*0.30;
        // statistical: 0.15*0.15.
        let expected = 0.2 * 0.55 + 0.15 * 0.30 + 0.15 * 0.15;
        assert!((w - expected).abs() < 1e-9, "w={w} expected={expected}");
    }

    #[test]
    fn weights_clamped_to_unit_interval() {
        let mut memories = Vec::new();
        for _ in 0..100 {
            memories.push(json!({
                "kind": "chat",
                "tags": ["topic:fm"],
                "feedback": {"positive_signals": 50, "negative_signals": 0},
            }));
        }
        let g = aggregate_gravity(&memories);
        assert!(g.values().all(|w| (-1.0..=1.0).contains(w)));
    }

    #[test]
    fn misalignment_cases() {
        let gravity: HashMap<String, f64> = HashMap::from([
            ("format:prose".to_string(), 0.4),
            ("topic:fm".to_string(), -0.1),
        ]);

        // no profile or no tags -> 0
        assert_eq!(compute_misalignment(&[], &gravity), 0.0);
        assert_eq!(compute_misalignment(&["x".into()], &HashMap::new()), 0.0);

        // no overlap -> mild 0.3
        assert_eq!(compute_misalignment(&["topic:workout".into()], &gravity), 0.3);

        // overlap with non-positive weight counts as misaligned
        let m = compute_misalignment(&["format:prose".into(), "topic:fm".into()], &gravity);
        assert!((m - 0.5).abs() < 1e-9);

        // fully aligned overlap -> 0
        assert_eq!(compute_misalignment(&["format:prose".into()], &gravity), 0.0);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let memories = vec![
            mem("style_mode", &["format:skeleton", "intent:analyze"]),
            mem("preference", &["topic:workout"]),
            json!({"kind": "chat", "tags": ["vb_desire:explicit_request"]}),
        ];
        let a = aggregate_gravity(&memories);
        let b = aggregate_gravity(&memories);
        assert_eq!(a, b);
    }
}
