// src/cards/consolidate.rs
// KV claim -> topic card consolidation. Newest done chat_log-derived
// sources update stable per-user cards keyed by attribute: many messages
// over time evolve one card instead of each message minting its own.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::cards::{add_card_link, clamp01, get_or_create_card, write_revision};
use crate::identity::resolve_canonical_user_id;

/// Harness/test attributes that must not pollute preference cards.
const IGNORED_ATTR_KEYS: &[&str] = &[
    "return_exactly",
    "say_exactly",
    "seedmemory",
    "seed_note",
    "threadctx",
    "audit",
];

const CURSOR_TOPIC: &str = "consolidate_kv_v2_cursor";

/// Evidence-count update for a card's strength and confidence.
///
/// Strength ratchets up with total observations and never decreases here
/// (decay is the only down-path). Confidence blends toward a target driven
/// by the dominance of the top value, and takes a flat 0.85 punishment when
/// the current value flips.
pub fn update_scores(
    counts: &BTreeMap<String, i64>,
    cur_strength: f64,
    cur_confidence: f64,
    value_changed: bool,
) -> (f64, f64) {
    let mut total_n: i64 = 0;
    let mut top_n: i64 = 0;
    for &v in counts.values() {
        if v < 0 {
            continue;
        }
        total_n += v;
        top_n = top_n.max(v);
    }
    if total_n <= 0 {
        total_n = 1;
        top_n = 1;
    }
    let p_top = top_n as f64 / total_n as f64;

    let strength_target = clamp01(0.50 + 0.35 * (((total_n - 1) as f64 / 10.0).clamp(0.0, 1.0)));
    let new_strength = cur_strength.max(strength_target);

    let conf_target =
        clamp01(0.30 + 0.40 * p_top + 0.30 * (((total_n - 1) as f64 / 5.0).clamp(0.0, 1.0)));
    let mut new_confidence = clamp01(0.7 * cur_confidence + 0.3 * conf_target);

    if value_changed {
        new_confidence = clamp01(new_confidence.min(cur_confidence * 0.85));
    }

    (new_strength, new_confidence)
}

/// `"{kind}/{attr_key}: {val}\nseen: {top-5 histogram}"`.
pub fn histogram_summary(kind: &str, attr_key: &str, val: &str, counts: &BTreeMap<String, i64>) -> String {
    let mut entries: Vec<(&String, &i64)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    let hist = entries
        .iter()
        .take(5)
        .map(|(k, n)| format!("{k}×{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{kind}/{attr_key}: {val}\nseen: {hist}")
}

fn counts_from_payload(payload: &JsonValue) -> BTreeMap<String, i64> {
    payload
        .get("value_counts")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

/// One consolidation pass: pick up to `limit_sources` newest done sources
/// not yet linked to the cursor card, fold their attr claims into per-user
/// topic cards, and refresh the cursor card's bookkeeping payload.
pub async fn card_consolidate_from_kv_once(
    pool: &PgPool,
    vantage_id: &str,
    limit_sources: i64,
) -> Result<JsonValue> {
    if limit_sources <= 0 {
        return Ok(json!({"ok": true, "updated_cards": 0, "limit_sources": limit_sources}));
    }

    let cursor_card_id = {
        let mut tx = pool.begin().await?;
        let id = get_or_create_card(&mut tx, vantage_id, "system", CURSOR_TOPIC).await?;
        tx.commit().await?;
        id
    };

    let rows = sqlx::query(
        "SELECT s.source_id, s.external_id, s.title, s.metadata, s.created_at
         FROM vantage_fact.source s
         LEFT JOIN vantage_card.card_link l
           ON l.card_id=$2 AND l.link_type='source' AND l.ref_id=s.source_id::text
         WHERE s.status='done'
           AND s.source_type='chat_log'
           AND l.card_id IS NULL
         ORDER BY s.source_id DESC
         LIMIT $1",
    )
    .bind(limit_sources)
    .bind(cursor_card_id)
    .fetch_all(pool)
    .await?;

    let mut updated = 0i64;
    let mut touched_cards: Vec<i64> = Vec::new();

    let mut tx = pool.begin().await?;
    for r in &rows {
        let source_id: i64 = r.get("source_id");
        let metadata: JsonValue = r.get::<Option<JsonValue>, _>("metadata").unwrap_or(json!({}));
        let created_at: chrono::DateTime<chrono::Utc> = r.get("created_at");

        let chat_log_id = metadata
            .get("chat_log_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let alias_user_id = metadata
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let (user_id, _) = resolve_canonical_user_id(pool, vantage_id, &alias_user_id).await;

        let title: String = r
            .get::<Option<String>, _>("title")
            .unwrap_or_default()
            .trim()
            .to_string();
        let title = if title.is_empty() { format!("source:{source_id}") } else { title };

        let doc_row: Option<(i64,)> = sqlx::query_as(
            "SELECT entity_id FROM vantage_fact.entity
             WHERE entity_type='document' AND canonical_name=$1
             ORDER BY entity_id DESC LIMIT 1",
        )
        .bind(&title)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((doc_eid,)) = doc_row else {
            add_card_link(&mut tx, cursor_card_id, "source", &source_id.to_string(), "skip:no_doc_entity").await?;
            continue;
        };

        let claims = sqlx::query(
            "SELECT claim_id, predicate, object_literal
             FROM vantage_fact.claim
             WHERE subject_entity_id=$1
               AND status='active'
               AND predicate LIKE 'attr.%'
             ORDER BY predicate ASC, claim_id ASC",
        )
        .bind(doc_eid)
        .fetch_all(&mut *tx)
        .await?;

        if claims.is_empty() {
            add_card_link(&mut tx, cursor_card_id, "source", &source_id.to_string(), "skip:no_attr_claims").await?;
            continue;
        }

        // Mark the source on the cursor card; note whether anything besides
        // ignored harness attributes was present.
        let has_effective = claims.iter().any(|c| {
            let pred: String = c.get("predicate");
            let attr_key = pred.strip_prefix("attr.").unwrap_or(&pred);
            !IGNORED_ATTR_KEYS.contains(&attr_key)
        });
        let note = if has_effective { "ok" } else { "skip:ignored_attr_keys" };
        add_card_link(&mut tx, cursor_card_id, "source", &source_id.to_string(), note).await?;

        for c in &claims {
            let claim_id: i64 = c.get("claim_id");
            let pred: String = c.get("predicate");
            let attr_key = pred.strip_prefix("attr.").unwrap_or(&pred).to_string();

            // audit flows to its own card kind; the other harness keys drop.
            if attr_key != "audit" && IGNORED_ATTR_KEYS.contains(&attr_key.as_str()) {
                continue;
            }
            let kind = if attr_key == "audit" { "audit" } else { "pref" };

            let obj: JsonValue = c.get::<Option<JsonValue>, _>("object_literal").unwrap_or(json!({}));
            let Some(val) = obj.get("v").and_then(|v| v.as_str()) else { continue };
            let val = val.trim().to_string();
            if val.is_empty() {
                continue;
            }

            let topic_key = format!("user/{user_id}/{kind}/{attr_key}");
            let card_id = get_or_create_card(&mut tx, vantage_id, kind, &topic_key).await?;

            let head = sqlx::query(
                "SELECT payload, strength, confidence FROM vantage_card.card_head WHERE card_id=$1",
            )
            .bind(card_id)
            .fetch_one(&mut *tx)
            .await?;

            let mut payload: JsonValue =
                head.get::<Option<JsonValue>, _>("payload").unwrap_or(json!({}));
            if !payload.is_object() {
                payload = json!({});
            }
            let cur_strength: f64 = head.get::<Option<f64>, _>("strength").unwrap_or(0.5);
            let cur_confidence: f64 = head.get::<Option<f64>, _>("confidence").unwrap_or(0.5);
            let prev_value = payload
                .get("current_value")
                .and_then(|v| v.as_str())
                .map(String::from);

            let mut counts = counts_from_payload(&payload);
            *counts.entry(val.clone()).or_insert(0) += 1;

            let obj_payload = payload.as_object_mut().unwrap();
            obj_payload.insert("mode".into(), json!("card_consolidate_kv_v2"));
            obj_payload.insert("source_id_last".into(), json!(source_id));
            obj_payload.insert("chat_log_id_last".into(), json!(chat_log_id));
            obj_payload.insert("user_id".into(), json!(user_id));
            obj_payload.insert("user_id_alias".into(), json!(alias_user_id));
            obj_payload.insert("attr_key".into(), json!(attr_key));
            obj_payload.insert("current_value".into(), json!(val));
            obj_payload.insert("value_counts".into(), json!(counts));
            obj_payload.insert("last_seen_at".into(), json!(created_at.to_rfc3339()));

            let summary = histogram_summary(kind, &attr_key, &val, &counts);
            write_revision(&mut tx, card_id, &summary, &payload, "consolidate_kv_v2", None).await?;

            let value_changed = prev_value
                .as_deref()
                .map(|p| p.trim() != val)
                .unwrap_or(false);
            let (new_strength, new_confidence) =
                update_scores(&counts, cur_strength, cur_confidence, value_changed);

            if (new_strength - cur_strength).abs() > 1e-6
                || (new_confidence - cur_confidence).abs() > 1e-6
            {
                sqlx::query(
                    "UPDATE vantage_card.card_head SET strength=$2, confidence=$3 WHERE card_id=$1",
                )
                .bind(card_id)
                .bind(new_strength)
                .bind(new_confidence)
                .execute(&mut *tx)
                .await?;
            }

            add_card_link(&mut tx, card_id, "source", &source_id.to_string(), "vantage_fact.source").await?;
            if let Some(ref clid) = chat_log_id {
                add_card_link(&mut tx, card_id, "chat_log", clid, "public.chat_log").await?;
            }
            add_card_link(&mut tx, card_id, "claim", &claim_id.to_string(), "vantage_fact.claim").await?;

            updated += 1;
            touched_cards.push(card_id);
        }
    }
    tx.commit().await?;

    // Cursor observability, only when new sources were processed.
    if !rows.is_empty() {
        let max_source_id = rows
            .iter()
            .map(|r| r.get::<i64, _>("source_id"))
            .max()
            .unwrap_or(0);

        let note_rows = sqlx::query(
            "SELECT note, count(*) AS n
             FROM vantage_card.card_link
             WHERE card_id=$1 AND link_type='source'
             GROUP BY 1
             ORDER BY n DESC, note ASC",
        )
        .bind(cursor_card_id)
        .fetch_all(pool)
        .await?;

        let mut note_counts = serde_json::Map::new();
        let mut total_links = 0i64;
        let mut ok_n = 0i64;
        for nr in &note_rows {
            let note: String = nr.get::<Option<String>, _>("note").unwrap_or_default();
            let n: i64 = nr.get("n");
            total_links += n;
            if note == "ok" {
                ok_n = n;
            }
            note_counts.insert(note, json!(n));
        }
        let skip_n = total_links - ok_n;

        let (done_n,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM vantage_fact.source WHERE source_type='chat_log' AND status='done'",
        )
        .fetch_one(pool)
        .await?;

        let mut tx = pool.begin().await?;
        let head = sqlx::query("SELECT payload FROM vantage_card.card_head WHERE card_id=$1")
            .bind(cursor_card_id)
            .fetch_one(&mut *tx)
            .await?;
        let mut cur_payload: JsonValue =
            head.get::<Option<JsonValue>, _>("payload").unwrap_or(json!({}));
        if !cur_payload.is_object() {
            cur_payload = json!({});
        }

        let obj = cur_payload.as_object_mut().unwrap();
        obj.insert("mode".into(), json!(CURSOR_TOPIC));
        obj.insert("cursor_updated_at".into(), json!(chrono::Utc::now().to_rfc3339()));
        obj.insert("cursor_done_chatlog_sources".into(), json!(done_n));
        obj.insert("cursor_link_sources".into(), json!(total_links));
        obj.insert("cursor_note_counts".into(), JsonValue::Object(note_counts));
        obj.insert(
            "cursor_last_batch".into(),
            json!({
                "processed": rows.len(),
                "max_source_id": max_source_id,
                "limit_sources": limit_sources,
            }),
        );

        let cur_summary = format!(
            "cursor: done={done_n} linked={total_links} ok={ok_n} skip={skip_n} last_source_id={max_source_id}"
        );
        sqlx::query(
            "UPDATE vantage_card.card_head
                SET updated_at=now(), summary=$2, payload=$3
              WHERE card_id=$1",
        )
        .bind(cursor_card_id)
        .bind(&cur_summary)
        .bind(&cur_payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
    }

    if updated > 0 {
        info!(updated, vantage_id = %vantage_id, "card consolidation pass complete");
    }

    Ok(json!({
        "ok": true,
        "updated_cards": updated,
        "card_ids": touched_cards.iter().take(50).collect::<Vec<_>>(),
        "limit_sources": limit_sources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn first_observation_sets_baseline_scores() {
        let c = counts(&[("yes", 1)]);
        let (s, conf) = update_scores(&c, 0.5, 0.5, false);
        // strength target 0.50, confidence blends toward 0.30+0.40 = 0.70
        assert!((s - 0.5).abs() < 1e-9);
        assert!((conf - (0.7 * 0.5 + 0.3 * 0.70)).abs() < 1e-9);
    }

    #[test]
    fn strength_is_monotone_in_evidence() {
        let mut prev = 0.5;
        for n in 1..=12 {
            let c = counts(&[("yes", n)]);
            let (s, _) = update_scores(&c, prev, 0.5, false);
            assert!(s >= prev, "n={n} s={s} prev={prev}");
            prev = s;
        }
        // Saturates at 0.85 once eleven observations have accumulated.
        assert!((prev - 0.85).abs() < 1e-9);
    }

    #[test]
    fn value_flip_punishes_confidence() {
        let c = counts(&[("red", 1), ("blue", 1)]);
        let (_, steady) = update_scores(&c, 0.6, 0.8, false);
        let (_, punished) = update_scores(&c, 0.6, 0.8, true);
        assert!(punished < steady);
        assert!(punished <= 0.8 * 0.85 + 1e-9);
    }

    #[test]
    fn empty_counts_fall_back_to_single_observation() {
        let c = BTreeMap::new();
        let (s, conf) = update_scores(&c, 0.2, 0.2, false);
        assert!((s - 0.5).abs() < 1e-9);
        assert!(conf > 0.2);
    }

    #[test]
    fn histogram_orders_by_count_then_value() {
        let c = counts(&[("calm", 2), ("tense", 2), ("zen", 5)]);
        let summary = histogram_summary("pref", "mood", "zen", &c);
        assert!(summary.starts_with("pref/mood: zen\nseen: "));
        assert!(summary.contains("zen×5, calm×2, tense×2"));
    }

    #[test]
    fn histogram_caps_at_five_entries() {
        let c = counts(&[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1), ("f", 1)]);
        let summary = histogram_summary("pref", "k", "a", &c);
        assert_eq!(summary.matches('×').count(), 5);
    }
}
