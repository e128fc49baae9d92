// src/retrieval/mod.rs
// Corpus + personal memory retrieval with tag/feedback/gravity-biased
// scoring. The corpus side honors per-vantage policy overrides (DB over
// env); the personal side filters to the caller's namespace and drops
// instrumentation probes.

pub mod tags;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use qdrant_client::qdrant::Filter;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::llm::Embedder;
use crate::policy::PolicyStore;
use crate::profiles::gravity::{compute_misalignment, load_gravity_profile};
use crate::profiles::payload_feedback;
use crate::retrieval::tags::{infer_query_tags, INTENT_TAGS};
use crate::vector::{match_field, Hit, VectorStore, IGNORED_COLLECTIONS, MEMORY_COLLECTION};

/// Texts that are instrumentation prompts, not memory.
const PROMPTY_MARKERS: &[&str] = &[
    "reply with only",
    "return exactly",
    "echo ",
    "one token",
    "no punctuation",
    "answer in one sentence",
    "debug",
    "preflight_",
    "memtest:",
    "memoryseed:",
    "seedmemory:",
];

const QUERY_TEST_PREFIXES: &[&str] = &[
    "say exactly:",
    "return exactly:",
    "reply with only",
    "reply with exactly",
    "echo decision",
    "echo model",
    "echo threadctx",
    "memtest:",
    "memoryseed:",
    "preflight_",
    "preflight:",
];

const EXCLUDED_PERSONAL_SOURCES: &[&str] = &[
    "frontend/chat:assistant",
    "gravity_daemon",
    "vb_desire_daemon",
    "memory_card",
];

/// Tags from a payload, accepting both list and map shapes.
pub fn payload_tag_set(payload: &JsonValue) -> HashSet<String> {
    match payload.get("tags") {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|t| t.as_str())
            .map(String::from)
            .collect(),
        Some(JsonValue::Object(map)) => map.keys().cloned().collect(),
        _ => HashSet::new(),
    }
}

fn payload_user_tags(payload: &JsonValue) -> HashSet<String> {
    payload
        .get("user_tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Corpus-side tag bonus: small nudges for format/tone/intent alignment.
pub fn corpus_tag_bonus(query_tags: &HashSet<String>, payload_tags: &HashSet<String>) -> f32 {
    let mut bonus = 0.0;

    if query_tags.contains("format:skeleton") {
        if payload_tags.contains("format:skeleton") {
            bonus += 0.05;
        } else if payload_tags.contains("format:prose") {
            bonus -= 0.02;
        }
    }
    if query_tags.contains("format:prose") {
        if payload_tags.contains("format:prose") {
            bonus += 0.05;
        } else if payload_tags.contains("format:skeleton") {
            bonus -= 0.02;
        }
    }
    if query_tags.contains("tone:meta") && payload_tags.contains("tone:meta") {
        bonus += 0.05;
    }
    for intent in INTENT_TAGS {
        if query_tags.contains(*intent) && payload_tags.contains(*intent) {
            bonus += 0.05;
        }
    }
    bonus
}

/// Personal-memory rescore: feedback, format/topic/intent alignment,
/// gravity alignment (damped under misalignment), and vb-desire bias.
#[allow(clippy::too_many_arguments)]
pub fn score_personal_hit(
    base: f32,
    payload: &JsonValue,
    query_tags: &HashSet<String>,
    gravity: &HashMap<String, f64>,
    misalignment: f64,
    bias_map: &HashMap<String, f64>,
) -> f64 {
    let mut score = base as f64;

    let (pos, neg) = payload_feedback(payload);
    let fb_delta = (0.05 * (pos - neg) as f64).clamp(-0.5, 0.5);
    score += fb_delta;

    let tags = payload_tag_set(payload);
    let user_tags = payload_user_tags(payload);
    let all_tags: HashSet<String> = tags.union(&user_tags).cloned().collect();

    // format alignment
    if query_tags.contains("format:skeleton") {
        if all_tags.contains("format:skeleton") {
            score += 0.15;
        } else if all_tags.contains("format:prose") {
            score -= 0.10;
        }
    }
    if query_tags.contains("format:prose") {
        if all_tags.contains("format:prose") {
            score += 0.15;
        } else if all_tags.contains("format:skeleton") {
            score -= 0.10;
        }
    }

    // topic + intent alignment
    for tag in query_tags {
        if tag.starts_with("topic:") && all_tags.contains(tag) {
            score += 0.08;
        }
        if tag.starts_with("intent:") && all_tags.contains(tag) {
            score += 0.04;
        }
    }

    // gravity alignment, damped when the query escapes the profile
    if !gravity.is_empty() {
        let mut gravity_bonus = 0.0;
        for t in &all_tags {
            if let Some(w) = gravity.get(t) {
                gravity_bonus += 0.08 * w;
            }
        }
        if misalignment > 0.5 {
            gravity_bonus *= 0.3;
        } else if misalignment > 0.2 {
            gravity_bonus *= 0.6;
        }
        score += gravity_bonus;
    }

    // vb-desire bias
    if !bias_map.is_empty() {
        let mut vb_bias = 0.0;
        for t in &all_tags {
            if let Some(b) = bias_map.get(t) {
                vb_bias += b;
            }
        }
        score += vb_bias.clamp(-0.25, 0.25);
    }

    score
}

pub struct Retriever {
    pub store: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub policy: Arc<PolicyStore>,
    pub corpus_primary_env: Vec<String>,
    pub corpus_fallback_env: Vec<String>,
    pub default_threshold: Option<f32>,
}

fn dedupe_keep_order(xs: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    xs.into_iter()
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .filter(|x| seen.insert(x.clone()))
        .collect()
}

impl Retriever {
    /// Unified corpus retrieval: curated primary collections first, fallback
    /// collections only if the primary pass comes up short.
    pub async fn unified_retrieve(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
        vantage_id: &str,
    ) -> Vec<Hit> {
        let q = query.trim();
        if q.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let vid = if vantage_id.trim().is_empty() { "default" } else { vantage_id.trim() };

        let vec = match self.embedder.embed(q).await {
            Ok(v) => v,
            Err(e) => {
                warn!("unified_retrieve: embed failed: {}", e);
                return Vec::new();
            }
        };
        let query_tags: HashSet<String> = infer_query_tags(q).into_iter().collect();

        let available: HashSet<String> = match self.store.corpus_collections().await {
            Ok(cols) => cols.into_iter().collect(),
            Err(e) => {
                warn!("unified_retrieve: list collections failed: {}", e);
                HashSet::new()
            }
        };

        let mut eff_primary = if self.corpus_primary_env.is_empty() {
            let mut all: Vec<String> = available.iter().cloned().collect();
            all.sort();
            all
        } else {
            self.corpus_primary_env.clone()
        };
        let mut eff_fallback = self.corpus_fallback_env.clone();

        let pol = self.policy.get(vid).await;
        if !pol.corpus_primary.is_empty() {
            eff_primary = pol.corpus_primary.clone();
        }
        if !pol.corpus_fallback.is_empty() {
            eff_fallback = pol.corpus_fallback.clone();
        }

        // First matching topic override (sorted tag order) replaces both
        // lists.
        let mut override_key: Option<String> = None;
        let mut sorted_tags: Vec<&String> = query_tags.iter().collect();
        sorted_tags.sort();
        for t in sorted_tags {
            if t.starts_with("topic:") {
                if let Some(ov) = pol.topic_overrides.get(t) {
                    if let Some(p) = &ov.corpus_primary {
                        eff_primary = p.clone();
                    }
                    if let Some(f) = &ov.corpus_fallback {
                        eff_fallback = f.clone();
                    }
                    override_key = Some(t.clone());
                    break;
                }
            }
        }

        let deny: HashSet<&String> = pol.deny_collections.iter().collect();
        let allow: HashSet<&String> = pol.allow_collections.iter().collect();
        let keep = |c: &String| {
            !IGNORED_COLLECTIONS.contains(&c.as_str())
                && !deny.contains(c)
                && (allow.is_empty() || allow.contains(c))
        };

        let eff_primary = dedupe_keep_order(eff_primary.into_iter().filter(|c| keep(c)).collect());
        let primary_set: HashSet<String> = eff_primary.iter().cloned().collect();
        let eff_fallback = dedupe_keep_order(
            eff_fallback
                .into_iter()
                .filter(|c| keep(c) && !primary_set.contains(c))
                .collect(),
        );

        let filter_available = |cols: Vec<String>| -> Vec<String> {
            if available.is_empty() {
                cols
            } else {
                cols.into_iter().filter(|c| available.contains(c)).collect()
            }
        };
        let eff_primary = filter_available(eff_primary);
        let eff_fallback = filter_available(eff_fallback);

        let thr = score_threshold.or(self.default_threshold).unwrap_or(0.30);
        debug!(
            vid = %vid,
            override_key = %override_key.as_deref().unwrap_or("-"),
            primary_n = eff_primary.len(),
            fallback_n = eff_fallback.len(),
            thr,
            top_k,
            "unified_retrieve"
        );

        let mut hits_all: Vec<Hit> = Vec::new();

        for coll in &eff_primary {
            self.search_corpus(coll, &vec, top_k, thr, &query_tags, &mut hits_all)
                .await;
        }
        if hits_all.len() < top_k {
            for coll in &eff_fallback {
                self.search_corpus(coll, &vec, top_k, thr, &query_tags, &mut hits_all)
                    .await;
                if hits_all.len() >= top_k {
                    break;
                }
            }
        }

        hits_all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits_all.truncate(top_k);
        hits_all
    }

    async fn search_corpus(
        &self,
        collection: &str,
        vec: &[f32],
        limit: usize,
        thr: f32,
        query_tags: &HashSet<String>,
        out: &mut Vec<Hit>,
    ) {
        match self
            .store
            .search(collection, vec, limit as u64, Some(thr), None)
            .await
        {
            Ok(hits) => {
                for mut h in hits {
                    let ptags = payload_tag_set(&h.payload);
                    h.score += corpus_tag_bonus(query_tags, &ptags);
                    out.push(h);
                }
            }
            Err(e) => warn!(collection = %collection, "corpus search failed: {}", e),
        }
    }

    /// Personal/episodic retrieval from memory_raw, filtered to the caller's
    /// namespace and rescored per feedback, tags, gravity, and desire bias.
    pub async fn retrieve_personal_memory(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
        vantage_id: &str,
        bias_map: &HashMap<String, f64>,
    ) -> Vec<Hit> {
        let q = query.trim();
        if q.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let vid = if vantage_id.trim().is_empty() { "default" } else { vantage_id.trim() };

        let vec = match self.embedder.embed(q).await {
            Ok(v) => v,
            Err(e) => {
                warn!("retrieve_personal_memory: embed failed: {}", e);
                return Vec::new();
            }
        };

        let query_tags: HashSet<String> = infer_query_tags(q).into_iter().collect();

        let gravity = if user_id.is_empty() {
            HashMap::new()
        } else {
            load_gravity_profile(&self.store, user_id).await
        };
        let misalignment = if gravity.is_empty() {
            0.0
        } else {
            let qt: Vec<String> = query_tags.iter().cloned().collect();
            compute_misalignment(&qt, &gravity)
        };
        debug!(user_id = %user_id, misalignment, "gravity check");

        let mut filter = Filter::default();
        if !user_id.is_empty() {
            filter.must.push(match_field("user_id", user_id));
        }
        for src in EXCLUDED_PERSONAL_SOURCES {
            filter.must_not.push(match_field("source", src));
        }

        // Oversample: the namespace check and probe filtering both happen
        // after the vector search.
        let limit = (top_k * 16).max(80) as u64;
        let thr = score_threshold.unwrap_or(0.20);

        let hits = match self
            .store
            .search(MEMORY_COLLECTION, &vec, limit, Some(thr), Some(filter))
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!("memory_raw search failed: {}", e);
                return Vec::new();
            }
        };

        let q_norm = q.to_lowercase();
        let query_is_test = QUERY_TEST_PREFIXES.iter().any(|p| q_norm.starts_with(p))
            || q_norm.contains("echo model id");

        let mut results: Vec<Hit> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut seen_texts: HashSet<String> = HashSet::new();

        for h in hits {
            if !seen_ids.insert(h.id.clone()) {
                continue;
            }

            let payload = &h.payload;
            let txt = payload
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();

            // Namespace: the active vantage, plus legacy points with no
            // vantage_id when the active vantage is the default.
            let pv = payload.get("vantage_id").and_then(|v| v.as_str()).unwrap_or("");
            if !(pv == vid || (pv.is_empty() && vid == "default")) {
                continue;
            }

            let src = payload
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();

            let txt_norm = txt.to_lowercase();

            // Probe prompts are not memory unless the query itself is one.
            if !query_is_test && src != "memory_card" {
                if QUERY_TEST_PREFIXES.iter().any(|p| txt_norm.starts_with(p)) {
                    continue;
                }
            }

            // Drop the just-asked message and duplicate texts.
            if txt_norm == q_norm {
                continue;
            }
            if !txt_norm.is_empty() && !seen_texts.insert(txt_norm.clone()) {
                continue;
            }

            if src == "frontend/chat:user" && PROMPTY_MARKERS.iter().any(|m| txt_norm.contains(m)) {
                continue;
            }

            let rescored =
                score_personal_hit(h.score, payload, &query_tags, &gravity, misalignment, bias_map);

            results.push(Hit { score: rescored as f32, ..h });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag_set(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn corpus_bonus_rewards_alignment() {
        let q = tag_set(&["format:skeleton", "intent:explain"]);
        let aligned = tag_set(&["format:skeleton", "intent:explain"]);
        let opposed = tag_set(&["format:prose"]);

        assert!((corpus_tag_bonus(&q, &aligned) - 0.10).abs() < 1e-6);
        assert!((corpus_tag_bonus(&q, &opposed) + 0.02).abs() < 1e-6);
        assert_eq!(corpus_tag_bonus(&q, &HashSet::new()), 0.0);
    }

    #[test]
    fn personal_rescore_combines_feedback_and_tags() {
        let payload = json!({
            "tags": ["format:skeleton", "topic:workout"],
            "feedback": {"positive_signals": 2, "negative_signals": 0},
        });
        let q = tag_set(&["format:skeleton", "topic:workout"]);
        let score =
            score_personal_hit(0.5, &payload, &q, &HashMap::new(), 0.0, &HashMap::new());
        // 0.5 + fb 0.10 + format 0.15 + topic 0.08
        assert!((score - 0.83).abs() < 1e-6, "score={score}");
    }

    #[test]
    fn feedback_delta_is_clamped() {
        let payload = json!({
            "tags": [],
            "feedback": {"positive_signals": 100, "negative_signals": 0},
        });
        let score = score_personal_hit(
            0.0,
            &payload,
            &HashSet::new(),
            &HashMap::new(),
            0.0,
            &HashMap::new(),
        );
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn gravity_bonus_damped_by_misalignment() {
        let payload = json!({"tags": ["topic:fm"]});
        let gravity = HashMap::from([("topic:fm".to_string(), 1.0f64)]);
        let q = HashSet::new();

        let aligned = score_personal_hit(0.0, &payload, &q, &gravity, 0.0, &HashMap::new());
        assert!((aligned - 0.08).abs() < 1e-9);

        let mild = score_personal_hit(0.0, &payload, &q, &gravity, 0.3, &HashMap::new());
        assert!((mild - 0.048).abs() < 1e-9);

        let strong = score_personal_hit(0.0, &payload, &q, &gravity, 0.7, &HashMap::new());
        assert!((strong - 0.024).abs() < 1e-9);
    }

    #[test]
    fn vb_bias_applies_to_user_tags_too() {
        let payload = json!({"tags": [], "user_tags": ["topic:fm"]});
        let bias = HashMap::from([("topic:fm".to_string(), 0.10f64)]);
        let score = score_personal_hit(
            0.0,
            &payload,
            &HashSet::new(),
            &HashMap::new(),
            0.0,
            &bias,
        );
        assert!((score - 0.10).abs() < 1e-9);
    }

    #[test]
    fn payload_tags_accept_list_and_map() {
        assert_eq!(
            payload_tag_set(&json!({"tags": ["a", "b"]})),
            tag_set(&["a", "b"])
        );
        assert_eq!(
            payload_tag_set(&json!({"tags": {"a": 1, "b": 2}})),
            tag_set(&["a", "b"])
        );
        assert!(payload_tag_set(&json!({})).is_empty());
    }

    #[test]
    fn dedupe_preserves_first_occurrence() {
        let xs = vec![
            "fm".to_string(),
            " fm ".to_string(),
            "hv".to_string(),
            "".to_string(),
        ];
        assert_eq!(dedupe_keep_order(xs), vec!["fm".to_string(), "hv".to_string()]);
    }
}
