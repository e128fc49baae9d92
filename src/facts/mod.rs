// src/facts/mod.rs
// Fact pipeline: seed sources from the transcript, extract deterministic
// key-value claims with evidence spans, and open contradictions when a
// single-valued predicate accumulates distinct active values.

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};

pub const KV_EXTRACTOR: &str = "kv_extractor";
pub const KV_EXTRACTOR_VERSION: &str = "v1";

static KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 _\-/]{0,64})\s*:\s*(.{1,500})\s*$").unwrap());
static KEY_NORM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static KEY_COLLAPSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize a KV key: lowercase, non-alphanumeric -> underscore, collapse,
/// trim, cap at 64 chars, fallback `unknown`.
pub fn norm_key(k: &str) -> String {
    let k = k.trim().to_lowercase();
    let k = KEY_NORM_RE.replace_all(&k, "_");
    let k = KEY_COLLAPSE_RE.replace_all(&k, "_");
    let k = k.trim_matches('_');
    if k.is_empty() {
        "unknown".to_string()
    } else {
        k.chars().take(64).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvFact {
    pub predicate: String,
    pub value: String,
    pub span_start: Option<i32>,
    pub span_end: Option<i32>,
    pub snippet: String,
}

/// Deterministic bootstrap extractor: parses `Key: Value` lines, tracking
/// byte offsets so evidence spans point back into the source content.
pub fn parse_kv_facts(content: &str, max_facts: usize) -> Vec<KvFact> {
    let mut facts = Vec::new();
    if content.is_empty() {
        return facts;
    }

    let mut offset = 0usize;
    for line in content.split('\n') {
        if let Some(caps) = KV_RE.captures(line) {
            let key = norm_key(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
            let val = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim().to_string();

            let span_start = content[offset..].find(line).map(|i| (offset + i) as i32);
            let span_end = span_start.map(|s| s + line.len() as i32);

            facts.push(KvFact {
                predicate: format!("attr.{key}"),
                value: val,
                span_start,
                span_end,
                snippet: line.chars().take(400).collect(),
            });
            if facts.len() >= max_facts {
                break;
            }
        }
        offset += line.len() + 1;
    }
    facts
}

/// `canonical_key` for a literal claim: stable hash over subject, predicate,
/// object literal, and qualifiers, all in compact JSON.
pub fn claim_canonical_key(
    subject_entity_id: i64,
    predicate: &str,
    object_literal: &JsonValue,
    qualifiers: &JsonValue,
) -> String {
    let obj = serde_json::to_string(object_literal).unwrap_or_default();
    let quals = serde_json::to_string(qualifiers).unwrap_or_default();
    sha256_hex(&format!("s={subject_entity_id}|p={predicate}|ol={obj}|q={quals}"))
}

pub async fn ensure_predicate(
    tx: &mut Transaction<'_, Postgres>,
    predicate: &str,
    cardinality: &str,
    description: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO vantage_fact.predicate(predicate, arg_schema, description)
         VALUES ($1, $2, $3)
         ON CONFLICT (predicate) DO NOTHING",
    )
    .bind(predicate)
    .bind(json!({"cardinality": cardinality}))
    .bind(if description.is_empty() { None } else { Some(description) })
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_or_create_entity(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    canonical_name: &str,
) -> Result<i64> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT entity_id FROM vantage_fact.entity
         WHERE entity_type=$1 AND canonical_name=$2
         ORDER BY entity_id ASC LIMIT 1",
    )
    .bind(entity_type)
    .bind(canonical_name)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_fact.entity(entity_type, canonical_name)
         VALUES ($1, $2) RETURNING entity_id",
    )
    .bind(entity_type)
    .bind(canonical_name)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// Upsert a string-literal claim. On conflict the claim's confidence only
/// ever goes up and `updated_at` is refreshed.
pub async fn upsert_claim_literal(
    tx: &mut Transaction<'_, Postgres>,
    subject_entity_id: i64,
    predicate: &str,
    value: &str,
    confidence: f64,
) -> Result<i64> {
    let obj = json!({"type": "str", "v": value});
    let qualifiers = json!({});
    let canonical_key = claim_canonical_key(subject_entity_id, predicate, &obj, &qualifiers);

    let (claim_id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_fact.claim(
             subject_entity_id, predicate, object_literal, qualifiers,
             confidence, status, canonical_key
         )
         VALUES ($1, $2, $3, $4, $5, 'active', $6)
         ON CONFLICT (canonical_key) DO UPDATE
             SET updated_at=now(),
                 confidence=GREATEST(vantage_fact.claim.confidence, EXCLUDED.confidence)
         RETURNING claim_id",
    )
    .bind(subject_entity_id)
    .bind(predicate)
    .bind(&obj)
    .bind(&qualifiers)
    .bind(confidence)
    .bind(&canonical_key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(claim_id)
}

#[allow(clippy::too_many_arguments)]
pub async fn add_evidence(
    tx: &mut Transaction<'_, Postgres>,
    claim_id: i64,
    source_id: i64,
    span_start: Option<i32>,
    span_end: Option<i32>,
    snippet: Option<&str>,
    extraction_confidence: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO vantage_fact.evidence(
             claim_id, source_id, span_start, span_end, snippet,
             extractor, extractor_version, extraction_confidence
         )
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(claim_id)
    .bind(source_id)
    .bind(span_start)
    .bind(span_end)
    .bind(snippet)
    .bind(KV_EXTRACTOR)
    .bind(KV_EXTRACTOR_VERSION)
    .bind(extraction_confidence)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Fact-side drive counters for the planner.
pub async fn compute_fact_drives(pool: &PgPool) -> Result<JsonValue> {
    let row = sqlx::query(
        r#"SELECT
          (SELECT count(*) FROM vantage_fact.source WHERE status='pending')      AS pending_sources,
          (SELECT count(*) FROM vantage_fact.source WHERE status='processing')   AS processing_sources,
          (SELECT count(*) FROM vantage_fact.source WHERE status='error')        AS error_sources,
          (SELECT count(*) FROM vantage_fact.entity)                             AS entities,
          (SELECT count(*) FROM vantage_fact.claim WHERE status='active')        AS active_claims,
          (SELECT count(*) FROM vantage_fact.claim WHERE status='active' AND confidence < 0.50) AS low_conf_claims,
          (SELECT count(*) FROM vantage_fact.contradiction WHERE status='open')  AS open_contradictions"#,
    )
    .fetch_one(pool)
    .await?;

    Ok(json!({
        "mode": "fact_drives_v1",
        "ts_unix": Utc::now().timestamp_millis() as f64 / 1000.0,
        "pending_sources": row.get::<i64, _>("pending_sources"),
        "processing_sources": row.get::<i64, _>("processing_sources"),
        "error_sources": row.get::<i64, _>("error_sources"),
        "entities": row.get::<i64, _>("entities"),
        "active_claims": row.get::<i64, _>("active_claims"),
        "low_conf_claims": row.get::<i64, _>("low_conf_claims"),
        "open_contradictions": row.get::<i64, _>("open_contradictions"),
    }))
}

/// Insert up to `limit` new user chat_log rows as pending sources, deduped
/// by external_id. Newest-first, so the pipeline tracks current behavior
/// instead of backfilling history. Only rows with at least one KV-ish line
/// are worth seeding; anything else yields no facts.
pub async fn fact_seed_from_chat_log_once(
    pool: &PgPool,
    vantage_id: &str,
    limit: i64,
) -> Result<JsonValue> {
    if limit <= 0 {
        return Ok(json!({"ok": true, "inserted": 0, "limit": limit, "vantage_id": vantage_id}));
    }

    let row = sqlx::query(
        r#"WITH candidates AS (
          SELECT cl.id, cl.user_id, cl.thread_id, cl.vantage_id, cl.created_at, cl.text
          FROM public.chat_log cl
          LEFT JOIN vantage_fact.source s
            ON s.external_id = ('chat_log:' || cl.id::text)
          WHERE cl.source = 'frontend/chat:user'
            AND cl.text IS NOT NULL
            AND length(cl.text) > 0
            AND length(cl.text) <= 8000
            AND cl.text ~ '(^|\n)[[:space:]]*[A-Za-z][A-Za-z0-9 _]*[[:space:]]*:[[:space:]]*[^\n]+'
            AND s.source_id IS NULL
            AND (
              ($1 = 'default' AND (cl.vantage_id IS NULL OR cl.vantage_id = 'default'))
              OR (cl.vantage_id = $1)
            )
          ORDER BY cl.created_at DESC
          LIMIT $2
        ),
        ins AS (
          INSERT INTO vantage_fact.source(source_type, external_id, title, content, metadata, status)
          SELECT
            'chat_log',
            'chat_log:' || id::text,
            'chat_log:user:' || COALESCE(vantage_id, '<NULL>') || ':' || id::text,
            text,
            jsonb_build_object(
              'origin','public.chat_log',
              'chat_log_id', id::text,
              'role','user',
              'user_id', user_id,
              'thread_id', CASE WHEN thread_id IS NULL THEN NULL ELSE thread_id::text END,
              'vantage_id', vantage_id,
              'created_at', created_at
            ),
            'pending'
          FROM candidates
          RETURNING source_id
        )
        SELECT count(*) AS inserted FROM ins"#,
    )
    .bind(vantage_id)
    .bind(limit)
    .fetch_one(pool)
    .await?;

    let inserted: i64 = row.get("inserted");
    Ok(json!({"ok": true, "inserted": inserted, "limit": limit, "vantage_id": vantage_id}))
}

/// Claim ONE pending source, mark it processing, extract deterministic KV
/// facts, write entities/claims/evidence, mark the source done. The whole
/// pass runs in a single transaction.
pub async fn fact_extract_once(pool: &PgPool, max_facts: usize) -> Result<JsonValue> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"WITH c AS (
          SELECT source_id, title, content
          FROM vantage_fact.source
          WHERE status='pending'
          ORDER BY source_id ASC
          FOR UPDATE SKIP LOCKED
          LIMIT 1
        )
        UPDATE vantage_fact.source s
           SET status='processing',
               updated_at=now()
          FROM c
         WHERE s.source_id=c.source_id
        RETURNING s.source_id, c.title, c.content"#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(json!({
            "ok": true, "processed_source_id": null, "claims_upserted": 0, "facts_found": 0
        }));
    };

    let source_id: i64 = row.get("source_id");
    let title: String = row.get::<Option<String>, _>("title").unwrap_or_default().trim().to_string();
    let content: String = row.get::<Option<String>, _>("content").unwrap_or_default();

    let content_sha = sha256_hex(&content);
    sqlx::query(
        "UPDATE vantage_fact.source SET content_sha256=$2, updated_at=now() WHERE source_id=$1",
    )
    .bind(source_id)
    .bind(&content_sha)
    .execute(&mut *tx)
    .await?;

    let doc_name = if title.is_empty() { format!("source:{source_id}") } else { title };
    let doc_eid = get_or_create_entity(&mut tx, "document", &doc_name).await?;

    // The content hash is always recorded as a claim of its own.
    ensure_predicate(&mut tx, "doc.content_sha256", "one", "sha256 of source content").await?;
    let c0 = upsert_claim_literal(&mut tx, doc_eid, "doc.content_sha256", &content_sha, 0.90).await?;
    add_evidence(&mut tx, c0, source_id, None, None, None, 0.90).await?;

    let facts = parse_kv_facts(&content, max_facts);

    let mut claims_upserted = 1i64;
    for f in &facts {
        ensure_predicate(&mut tx, &f.predicate, "one", "key-value attribute from source").await?;
        let cid = upsert_claim_literal(&mut tx, doc_eid, &f.predicate, &f.value, 0.60).await?;
        add_evidence(
            &mut tx,
            cid,
            source_id,
            f.span_start,
            f.span_end,
            Some(&f.snippet),
            0.60,
        )
        .await?;
        claims_upserted += 1;
    }

    sqlx::query(
        "UPDATE vantage_fact.source
            SET status='done', processed_at=now(), updated_at=now(), error=NULL
          WHERE source_id=$1",
    )
    .bind(source_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(json!({
        "ok": true,
        "processed_source_id": source_id,
        "doc_entity_id": doc_eid,
        "facts_found": facts.len(),
        "claims_upserted": claims_upserted,
    }))
}

/// Open contradiction objects for cardinality=one predicates where a subject
/// has more than one distinct active value. Members accumulate idempotently;
/// nothing is auto-resolved.
pub async fn fact_contradiction_scan_once(pool: &PgPool, max_groups: i64) -> Result<JsonValue> {
    let rows = sqlx::query(
        r#"WITH single_preds AS (
          SELECT predicate
          FROM vantage_fact.predicate
          WHERE (arg_schema->>'cardinality')='one'
        ),
        g AS (
          SELECT
            c.subject_entity_id,
            c.predicate,
            count(*) AS n,
            count(distinct coalesce(c.object_entity_id::text, c.object_literal::text)) AS distinct_n,
            array_agg(c.claim_id ORDER BY c.claim_id) AS claim_ids
          FROM vantage_fact.claim c
          WHERE c.status='active'
            AND c.predicate IN (SELECT predicate FROM single_preds)
          GROUP BY c.subject_entity_id, c.predicate
          HAVING count(distinct coalesce(c.object_entity_id::text, c.object_literal::text)) > 1
          ORDER BY distinct_n DESC, n DESC
          LIMIT $1
        )
        SELECT subject_entity_id, predicate, claim_ids FROM g"#,
    )
    .bind(max_groups)
    .fetch_all(pool)
    .await?;

    let mut created = 0i64;
    let mut groups_scanned = 0i64;

    let mut tx = pool.begin().await?;
    for r in &rows {
        groups_scanned += 1;
        let subject_entity_id: i64 = r.get("subject_entity_id");
        let predicate: String = r.get("predicate");
        let claim_ids: Vec<i64> = r.get("claim_ids");
        let qualifier_key = ""; // no qualifier bucketing yet

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT contradiction_id
             FROM vantage_fact.contradiction
             WHERE subject_entity_id=$1 AND predicate=$2 AND qualifier_key=$3 AND status='open'
             ORDER BY contradiction_id DESC LIMIT 1",
        )
        .bind(subject_entity_id)
        .bind(&predicate)
        .bind(qualifier_key)
        .fetch_optional(&mut *tx)
        .await?;

        let cid = match existing {
            Some((cid,)) => cid,
            None => {
                let (cid,): (i64,) = sqlx::query_as(
                    "INSERT INTO vantage_fact.contradiction(
                         subject_entity_id, predicate, qualifier_key, status, description
                     )
                     VALUES ($1,$2,$3,'open',$4)
                     RETURNING contradiction_id",
                )
                .bind(subject_entity_id)
                .bind(&predicate)
                .bind(qualifier_key)
                .bind("cardinality=one but multiple distinct active values")
                .fetch_one(&mut *tx)
                .await?;
                created += 1;
                cid
            }
        };

        for claim_id in claim_ids {
            sqlx::query(
                "INSERT INTO vantage_fact.contradiction_member(contradiction_id, claim_id)
                 VALUES ($1,$2) ON CONFLICT DO NOTHING",
            )
            .bind(cid)
            .bind(claim_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE vantage_fact.contradiction SET updated_at=now() WHERE contradiction_id=$1")
            .bind(cid)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(json!({
        "ok": true,
        "groups_scanned": groups_scanned,
        "contradictions_created": created,
        "max_groups": max_groups,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization() {
        assert_eq!(norm_key("Mood"), "mood");
        assert_eq!(norm_key("  Favorite Color "), "favorite_color");
        assert_eq!(norm_key("A--B__C"), "a_b_c");
        assert_eq!(norm_key("###"), "unknown");
        let long = "x".repeat(100);
        assert_eq!(norm_key(&long).len(), 64);
    }

    #[test]
    fn kv_lines_parse_with_spans() {
        let content = "Coffee: yes\nMood: calm";
        let facts = parse_kv_facts(content, 50);
        assert_eq!(facts.len(), 2);

        assert_eq!(facts[0].predicate, "attr.coffee");
        assert_eq!(facts[0].value, "yes");
        assert_eq!(facts[0].span_start, Some(0));
        assert_eq!(facts[0].span_end, Some(11));

        assert_eq!(facts[1].predicate, "attr.mood");
        assert_eq!(facts[1].value, "calm");
        assert_eq!(facts[1].span_start, Some(12));
        assert_eq!(facts[1].span_end, Some(22));
    }

    #[test]
    fn padded_kv_line_extracts_trimmed_value() {
        let facts = parse_kv_facts("  Mood: calm, focused  ", 50);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].predicate, "attr.mood");
        assert_eq!(facts[0].value, "calm, focused");
    }

    #[test]
    fn non_kv_lines_are_skipped() {
        let facts = parse_kv_facts("just a sentence\nAnother one.\nKey: value", 50);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].predicate, "attr.key");
    }

    #[test]
    fn max_facts_caps_extraction() {
        let content = "A: 1\nB: 2\nC: 3";
        assert_eq!(parse_kv_facts(content, 2).len(), 2);
    }

    #[test]
    fn canonical_key_is_stable_and_value_sensitive() {
        let obj_red = json!({"type": "str", "v": "red"});
        let obj_blue = json!({"type": "str", "v": "blue"});
        let quals = json!({});

        let a = claim_canonical_key(7, "attr.favorite", &obj_red, &quals);
        let b = claim_canonical_key(7, "attr.favorite", &obj_red, &quals);
        let c = claim_canonical_key(7, "attr.favorite", &obj_blue, &quals);
        let d = claim_canonical_key(8, "attr.favorite", &obj_red, &quals);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn snippet_caps_at_400_chars() {
        let long_val = "v".repeat(480);
        let content = format!("Key: {long_val}");
        let facts = parse_kv_facts(&content, 50);
        assert_eq!(facts[0].snippet.chars().count(), 400);
    }
}
