// src/cards/mod.rs
// Card store: heads with mutable strength/confidence, append-only revisions,
// idempotent links, and reinforcement signals. Consolidation and decay are
// the two background passes that evolve cards over time.

pub mod consolidate;
pub mod decay;

use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};

pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Strength/confidence are stored rounded to three decimal places.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

pub async fn get_or_create_card(
    tx: &mut Transaction<'_, Postgres>,
    vantage_id: &str,
    kind: &str,
    topic_key: &str,
) -> Result<i64> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT card_id FROM vantage_card.card_head
         WHERE vantage_id=$1 AND kind=$2 AND topic_key=$3 LIMIT 1",
    )
    .bind(vantage_id)
    .bind(kind)
    .bind(topic_key)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_card.card_head(vantage_id, kind, topic_key, summary, payload)
         VALUES ($1,$2,$3,'','{}'::jsonb)
         RETURNING card_id",
    )
    .bind(vantage_id)
    .bind(kind)
    .bind(topic_key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// Append a revision and refresh the head's summary/payload. The revision is
/// written first so a reader that sees the new head always finds a matching
/// revision.
pub async fn write_revision(
    tx: &mut Transaction<'_, Postgres>,
    card_id: i64,
    summary: &str,
    payload: &JsonValue,
    reason: &str,
    delta: Option<&JsonValue>,
) -> Result<i64> {
    let prev: Option<(i64,)> = sqlx::query_as(
        "SELECT revision_id FROM vantage_card.card_revision
         WHERE card_id=$1 ORDER BY revision_id DESC LIMIT 1",
    )
    .bind(card_id)
    .fetch_optional(&mut **tx)
    .await?;

    let empty = serde_json::json!({});
    let (revision_id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_card.card_revision(card_id, prev_revision_id, summary, payload, reason, delta)
         VALUES ($1,$2,$3,$4,$5,$6)
         RETURNING revision_id",
    )
    .bind(card_id)
    .bind(prev.map(|(id,)| id))
    .bind(summary)
    .bind(payload)
    .bind(reason)
    .bind(delta.unwrap_or(&empty))
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE vantage_card.card_head
            SET updated_at=now(), summary=$2, payload=$3
          WHERE card_id=$1",
    )
    .bind(card_id)
    .bind(summary)
    .bind(payload)
    .execute(&mut **tx)
    .await?;

    Ok(revision_id)
}

pub async fn add_card_link(
    tx: &mut Transaction<'_, Postgres>,
    card_id: i64,
    link_type: &str,
    ref_id: &str,
    note: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO vantage_card.card_link(card_id, link_type, ref_id, note)
         VALUES ($1,$2,$3,$4)
         ON CONFLICT DO NOTHING",
    )
    .bind(card_id)
    .bind(link_type)
    .bind(ref_id)
    .bind(note)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record a reinforcement signal against a card topic. Consumed by decay.
pub async fn add_card_signal(
    pool: &PgPool,
    vantage_id: &str,
    kind: &str,
    topic_key: &str,
    signal_type: &str,
    magnitude: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO vantage_card.card_signal(vantage_id, kind, topic_key, signal_type, magnitude)
         VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(vantage_id)
    .bind(kind)
    .bind(topic_key)
    .bind(signal_type)
    .bind(magnitude)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_matches_storage_precision() {
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(0.9996), 1.0);
        assert_eq!(round3(0.0004), 0.0);
    }
}
