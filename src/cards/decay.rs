// src/cards/decay.rs
// Incremental, signal-aware card decay. Keyed off payload.last_decay_at so
// the result depends only on elapsed time and the signals that arrived in
// between, not on how often the pass runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::cards::{clamp01, round3};

#[derive(Debug, Clone, Copy)]
pub struct DecayParams {
    pub half_life_days: f64,
    pub signal_window_days: i64,
    pub min_interval_minutes: i64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self { half_life_days: 45.0, signal_window_days: 180, min_interval_minutes: 60 }
    }
}

impl DecayParams {
    pub fn sanitized(mut self) -> Self {
        if self.half_life_days <= 0.0 {
            self.half_life_days = 45.0;
        }
        if self.signal_window_days <= 0 {
            self.signal_window_days = 180;
        }
        if self.min_interval_minutes < 0 {
            self.min_interval_minutes = 0;
        }
        self
    }

    pub fn min_interval_days(&self) -> f64 {
        self.min_interval_minutes as f64 / 1440.0
    }
}

/// Summed signals since the last decay reference point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalSums {
    pub reward: f64,
    pub punish: f64,
    pub used: f64,
}

impl SignalSums {
    pub fn any(&self) -> bool {
        self.reward + self.punish + self.used > 0.0
    }
}

/// Pure decay step. Strength halves every `half_life_days`, with bounded
/// deltas from signals. Confidence decays on a 4x half-life (floor 180 days)
/// and reacts only weakly to signals. Results are rounded to 3 decimals.
pub fn decay_scores(
    strength: f64,
    confidence: f64,
    dt_days: f64,
    params: &DecayParams,
    signals: &SignalSums,
) -> (f64, f64) {
    let dt_days = dt_days.max(0.0);
    let factor = 0.5f64.powf(dt_days / params.half_life_days);

    let mut delta = 0.0;
    delta += (0.02 * signals.used).min(0.20);
    delta += (0.05 * signals.reward).min(0.20);
    delta -= (0.07 * signals.punish).min(0.30);

    let new_strength = clamp01(strength * factor + delta);

    let conf_half_life = (params.half_life_days * 4.0).max(180.0);
    let conf_factor = 0.5f64.powf(dt_days / conf_half_life);
    let new_confidence = clamp01(
        confidence * conf_factor + (0.01 * signals.reward).min(0.10)
            - (0.02 * signals.punish).min(0.15),
    );

    (round3(new_strength), round3(new_confidence))
}

fn parse_last_decay_at(payload: &JsonValue) -> Option<DateTime<Utc>> {
    let raw = payload.get("last_decay_at")?.as_str()?;
    let mut normalized = raw.trim().replace('Z', "+00:00").replace(' ', "T");
    // Postgres `now()::text` renders the offset as a bare "+00".
    let bytes = normalized.as_bytes();
    if bytes.len() > 3 {
        let tail = &normalized[normalized.len() - 3..];
        if (tail.starts_with('+') || tail.starts_with('-'))
            && tail[1..].chars().all(|c| c.is_ascii_digit())
        {
            normalized.push_str(":00");
        }
    }
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// One decay pass over up to `limit_cards` active, non-system cards,
/// oldest-updated first. Writes back strength/confidence and stamps
/// payload.last_decay_at without touching the content timestamp.
pub async fn card_decay_once(
    pool: &PgPool,
    vantage_id: &str,
    limit_cards: i64,
    params: DecayParams,
) -> Result<JsonValue> {
    if limit_cards <= 0 {
        return Ok(json!({"ok": true, "updated": 0, "limit_cards": limit_cards}));
    }
    let params = params.sanitized();
    let min_interval_days = params.min_interval_days();

    let cards = sqlx::query(
        "SELECT card_id, kind, topic_key, strength, confidence, updated_at, payload
         FROM vantage_card.card_head
         WHERE vantage_id=$1 AND status='active' AND kind<>'system'
         ORDER BY updated_at ASC
         LIMIT $2",
    )
    .bind(vantage_id)
    .bind(limit_cards)
    .fetch_all(pool)
    .await?;

    let mut updated = 0i64;
    let mut touched: Vec<i64> = Vec::new();
    let now = Utc::now();

    let mut tx = pool.begin().await?;
    for c in &cards {
        let card_id: i64 = c.get("card_id");
        let kind: String = c.get("kind");
        let topic_key: String = c.get("topic_key");
        let strength: f64 = c.get("strength");
        let confidence: f64 = c.get("confidence");
        let updated_at: DateTime<Utc> = c.get("updated_at");
        let payload: JsonValue = c.get::<Option<JsonValue>, _>("payload").unwrap_or(json!({}));

        let last_ref = parse_last_decay_at(&payload).unwrap_or(updated_at);
        let dt_days =
            (now.signed_duration_since(last_ref).num_milliseconds() as f64 / 86_400_000.0).max(0.0);

        let sig = sqlx::query(
            "SELECT
               COALESCE(sum(CASE WHEN signal_type='reward' THEN magnitude ELSE 0 END),0) AS reward,
               COALESCE(sum(CASE WHEN signal_type IN ('punish','correction') THEN magnitude ELSE 0 END),0) AS punish,
               COALESCE(sum(CASE WHEN signal_type='use' THEN magnitude ELSE 0 END),0) AS used
             FROM vantage_card.card_signal
             WHERE vantage_id=$1 AND kind=$2 AND topic_key=$3
               AND created_at > $4
               AND created_at >= now() - ($5::bigint * interval '1 day')",
        )
        .bind(vantage_id)
        .bind(&kind)
        .bind(&topic_key)
        .bind(last_ref)
        .bind(params.signal_window_days)
        .fetch_one(&mut *tx)
        .await?;

        let signals = SignalSums {
            reward: sig.get("reward"),
            punish: sig.get("punish"),
            used: sig.get("used"),
        };

        // Nothing new and too soon: skip to avoid minute-loop churn.
        if !signals.any() && dt_days < min_interval_days {
            continue;
        }

        let (new_strength, new_confidence) =
            decay_scores(strength, confidence, dt_days, &params, &signals);
        let old_strength = round3(strength);
        let old_confidence = round3(confidence);

        if new_strength != old_strength
            || new_confidence != old_confidence
            || signals.any()
            || dt_days >= min_interval_days
        {
            sqlx::query(
                "UPDATE vantage_card.card_head
                    SET strength=$2,
                        confidence=$3,
                        payload=jsonb_set(payload,'{last_decay_at}', to_jsonb(now()::text), true)
                  WHERE card_id=$1",
            )
            .bind(card_id)
            .bind(new_strength)
            .bind(new_confidence)
            .execute(&mut *tx)
            .await?;
            updated += 1;
            touched.push(card_id);
        }
    }
    tx.commit().await?;

    debug!(updated, vantage_id = %vantage_id, "card decay pass complete");

    Ok(json!({
        "ok": true,
        "job": "card_decay_v1",
        "updated": updated,
        "touched_card_ids": touched.iter().take(50).collect::<Vec<_>>(),
        "limit_cards": limit_cards,
        "half_life_days": params.half_life_days,
        "signal_window_days": params.signal_window_days,
        "min_interval_minutes": params.min_interval_minutes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_half_life_halves_strength() {
        let params = DecayParams::default();
        let (s, _) = decay_scores(0.80, 0.5, 45.0, &params, &SignalSums::default());
        assert!((s - 0.40).abs() < 1e-9, "s={s}");
    }

    #[test]
    fn zero_elapsed_time_is_identity() {
        let params = DecayParams::default();
        let (s, c) = decay_scores(0.8, 0.6, 0.0, &params, &SignalSums::default());
        assert_eq!(s, 0.8);
        assert_eq!(c, 0.6);
    }

    #[test]
    fn confidence_decays_on_longer_half_life() {
        let params = DecayParams::default();
        // conf half-life = max(180, 45*4) = 180 days
        let (_, c) = decay_scores(0.5, 0.8, 180.0, &params, &SignalSums::default());
        assert!((c - 0.40).abs() < 1e-9, "c={c}");
    }

    #[test]
    fn signals_apply_bounded_deltas() {
        let params = DecayParams::default();
        let signals = SignalSums { reward: 100.0, punish: 0.0, used: 100.0 };
        let (s, c) = decay_scores(0.0, 0.0, 0.0, &params, &signals);
        // use capped at 0.20, reward capped at 0.20
        assert!((s - 0.40).abs() < 1e-9);
        // confidence reward capped at 0.10
        assert!((c - 0.10).abs() < 1e-9);

        let punished = SignalSums { reward: 0.0, punish: 100.0, used: 0.0 };
        let (s, c) = decay_scores(1.0, 1.0, 0.0, &params, &punished);
        assert!((s - 0.70).abs() < 1e-9);
        assert!((c - 0.85).abs() < 1e-9);
    }

    #[test]
    fn decay_is_commutative_over_splits() {
        // Decaying 30 days then 15 equals decaying 45 in one pass when no
        // signals arrive (modulo the 3dp storage rounding).
        let params = DecayParams::default();
        let none = SignalSums::default();

        let (s_once, _) = decay_scores(0.8, 0.5, 45.0, &params, &none);

        let (s_mid, c_mid) = decay_scores(0.8, 0.5, 30.0, &params, &none);
        let (s_split, _) = decay_scores(s_mid, c_mid, 15.0, &params, &none);

        assert!((s_once - s_split).abs() <= 0.002, "once={s_once} split={s_split}");
    }

    #[test]
    fn results_round_to_three_decimals() {
        let params = DecayParams::default();
        let (s, c) = decay_scores(0.777777, 0.333333, 1.0, &params, &SignalSums::default());
        assert_eq!(s, round3(s));
        assert_eq!(c, round3(c));
    }

    #[test]
    fn last_decay_at_parses_postgres_and_iso_forms() {
        let p = json!({"last_decay_at": "2026-07-01 12:00:00.123456+00"});
        assert!(parse_last_decay_at(&p).is_some());
        let p = json!({"last_decay_at": "2026-07-01T12:00:00Z"});
        assert!(parse_last_decay_at(&p).is_some());
        assert!(parse_last_decay_at(&json!({})).is_none());
        assert!(parse_last_decay_at(&json!({"last_decay_at": "not a time"})).is_none());
    }
}
