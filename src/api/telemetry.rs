// src/api/telemetry.rs
// Write-only telemetry sink (idempotent by event_id) and bucketed
// time-series aggregates with condition-phase overlay.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::Row;
use uuid::Uuid;

use crate::api::common::RequestId;
use crate::api::error::{ApiError, ApiResult, OrInternal};
use crate::state::AppState;

const ACTOR_HEADER: &str = "x-vs-actor-user-id";

#[derive(Debug, Deserialize)]
pub struct TelemetryBody {
    pub events: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub metric_key: String,
    pub subject_type: String,
    pub subject_id: String,
    pub from: String,
    pub to: String,
    pub bucket: Option<String>,
    pub target_model_id: Option<String>,
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let normalized = if t.ends_with('Z') {
        format!("{}+00:00", &t[..t.len() - 1])
    } else {
        t.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn actor_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(128).collect())
}

fn opt_str(e: &JsonValue, key: &str) -> Option<String> {
    e.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// POST /telemetry/event
pub async fn telemetry_event(
    State(app): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<TelemetryBody>,
) -> ApiResult<Json<JsonValue>> {
    let Some(events) = body.events.filter(|e| !e.is_empty()) else {
        return Err(ApiError::bad_request("missing events[]"));
    };

    let actor_user_id = actor_from_headers(&headers);

    let mut accepted = 0i64;
    let mut rejected = 0i64;
    let mut errors: Vec<JsonValue> = Vec::new();

    for (i, e) in events.iter().enumerate() {
        let Some(obj) = e.as_object() else {
            rejected += 1;
            errors.push(json!({"index": i, "reason": "event not object"}));
            continue;
        };

        let event_id = obj
            .get("event_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s.trim()).ok());
        let Some(event_id) = event_id else {
            rejected += 1;
            errors.push(json!({"index": i, "reason": "invalid/missing event_id (uuid)"}));
            continue;
        };

        let event_type = opt_str(e, "event_type").unwrap_or_default();
        let subject_type = opt_str(e, "subject_type").unwrap_or_default();
        let subject_id = opt_str(e, "subject_id").unwrap_or_default();
        if event_type.is_empty() || subject_type.is_empty() || subject_id.is_empty() {
            rejected += 1;
            errors.push(json!({"index": i, "reason": "missing event_type/subject_type/subject_id"}));
            continue;
        }

        let occurred_at = obj
            .get("occurred_at")
            .and_then(|v| v.as_str())
            .and_then(parse_ts)
            .or_else(|| obj.get("created_at").and_then(|v| v.as_str()).and_then(parse_ts))
            .unwrap_or_else(Utc::now);

        let mut payload = obj
            .get("payload")
            .filter(|p| p.is_object())
            .cloned()
            .unwrap_or(json!({}));
        if payload.get("request_id").is_none() {
            payload["request_id"] = json!(request_id.clone());
        }

        sqlx::query(
            "INSERT INTO telemetry_event (
                 event_id, event_type,
                 subject_type, subject_id,
                 target_model_id, target_model_version,
                 judge_model_id, judge_model_version,
                 vantage_id, condition_id,
                 thread_id, turn_id,
                 actor_user_id,
                 payload, occurred_at
             )
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(&event_type)
        .bind(&subject_type)
        .bind(&subject_id)
        .bind(opt_str(e, "target_model_id"))
        .bind(opt_str(e, "target_model_version"))
        .bind(opt_str(e, "judge_model_id"))
        .bind(opt_str(e, "judge_model_version"))
        .bind(opt_str(e, "vantage_id"))
        .bind(opt_str(e, "condition_id"))
        .bind(opt_str(e, "thread_id"))
        .bind(opt_str(e, "turn_id"))
        .bind(actor_user_id.as_deref())
        .bind(&payload)
        .bind(occurred_at)
        .execute(&app.pool)
        .await
        .or_internal("telemetry insert failed")?;

        accepted += 1;
    }

    Ok(Json(json!({"accepted": accepted, "rejected": rejected, "errors": errors})))
}

/// Metric registry: SQL value expression over the event payload plus the
/// event-type restriction it applies to.
fn metric_expr(metric_key: &str) -> Option<(&'static str, &'static str)> {
    let defs: &[(&str, &str, &str)] = &[
        (
            "probe_overall",
            "NULLIF(payload->'scores'->>'overall','')::double precision",
            "event_type IN ('probe.response','chat.response')",
        ),
        (
            "hallucination_rate",
            "CASE WHEN (payload->'flags'->>'hallucination')='true' THEN 1.0 \
             WHEN (payload->'flags'->>'hallucination')='false' THEN 0.0 ELSE NULL END",
            "event_type IN ('probe.response','chat.response')",
        ),
        (
            "concession_rate",
            "CASE WHEN (payload->'flags'->>'concession')='true' THEN 1.0 \
             WHEN (payload->'flags'->>'concession')='false' THEN 0.0 ELSE NULL END",
            "event_type IN ('probe.response','chat.response')",
        ),
        (
            "clarification_rate",
            "CASE WHEN (payload->'flags'->>'clarification')='true' THEN 1.0 \
             WHEN (payload->'flags'->>'clarification')='false' THEN 0.0 ELSE NULL END",
            "event_type IN ('probe.response','chat.response')",
        ),
        (
            "style_drift",
            "NULLIF(payload->'scores'->>'style_drift','')::double precision",
            "event_type IN ('probe.response','chat.response')",
        ),
        (
            "refusal_rate",
            "CASE WHEN (payload->'flags'->>'refusal')='true' THEN 1.0 \
             WHEN (payload->'flags'->>'refusal')='false' THEN 0.0 ELSE NULL END",
            "event_type IN ('probe.response','chat.response')",
        ),
    ];
    defs.iter()
        .find(|(k, _, _)| *k == metric_key)
        .map(|(_, expr, wh)| (*expr, *wh))
}

/// GET /metrics/timeseries
pub async fn metrics_timeseries(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TimeseriesQuery>,
) -> ApiResult<Json<JsonValue>> {
    let bucket = q.bucket.as_deref().unwrap_or("day").trim().to_lowercase();
    if bucket != "hour" && bucket != "day" {
        return Err(ApiError::bad_request("bucket must be 'hour' or 'day'"));
    }

    let start = parse_ts(&q.from).ok_or_else(|| ApiError::bad_request("invalid from timestamp"))?;
    let end = parse_ts(&q.to).ok_or_else(|| ApiError::bad_request("invalid to timestamp"))?;

    let (expr, default_where) = metric_expr(&q.metric_key)
        .ok_or_else(|| ApiError::bad_request(format!("unknown metric_key '{}'", q.metric_key)))?;

    let actor_user_id = actor_from_headers(&headers);

    let mut wh: Vec<String> = vec![
        "subject_type=$1".into(),
        "subject_id=$2".into(),
        "occurred_at >= $3".into(),
        "occurred_at < $4".into(),
        default_where.to_string(),
    ];
    let mut idx = 5;
    if q.target_model_id.is_some() {
        wh.push(format!("target_model_id=${idx}"));
        idx += 1;
    }
    if actor_user_id.is_some() {
        wh.push(format!("actor_user_id=${idx}"));
    }
    let where_sql = wh
        .iter()
        .map(|w| format!("({w})"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let sql = format!(
        "SELECT date_trunc('{bucket}', occurred_at) AS t, AVG({expr}) AS v, COUNT({expr}) AS n
         FROM telemetry_event
         WHERE {where_sql}
         GROUP BY 1
         ORDER BY 1"
    );

    let mut query = sqlx::query(&sql)
        .bind(&q.subject_type)
        .bind(&q.subject_id)
        .bind(start)
        .bind(end);
    if let Some(tm) = &q.target_model_id {
        query = query.bind(tm);
    }
    if let Some(actor) = &actor_user_id {
        query = query.bind(actor);
    }

    let rows = query
        .fetch_all(&app.pool)
        .await
        .or_internal("timeseries query failed")?;

    let points: Vec<JsonValue> = rows
        .iter()
        .map(|r| {
            json!({
                "t": r.get::<DateTime<Utc>, _>("t").to_rfc3339(),
                "v": r.get::<Option<f64>, _>("v"),
                "n": r.get::<i64, _>("n"),
                "meta": {"method": "v0_jsonb_expr"},
            })
        })
        .collect();

    // Phase overlay: the condition active at the window start plus every
    // condition.set inside the window; each phase ends where the next starts.
    let (base, within) = if let Some(actor) = &actor_user_id {
        let base = sqlx::query(
            "SELECT condition_id, occurred_at, payload FROM telemetry_event
             WHERE subject_type=$1 AND subject_id=$2 AND actor_user_id=$3
               AND event_type='condition.set' AND occurred_at < $4
             ORDER BY occurred_at DESC LIMIT 1",
        )
        .bind(&q.subject_type)
        .bind(&q.subject_id)
        .bind(actor)
        .bind(start)
        .fetch_optional(&app.pool)
        .await
        .or_internal("phase query failed")?;
        let within = sqlx::query(
            "SELECT condition_id, occurred_at, payload FROM telemetry_event
             WHERE subject_type=$1 AND subject_id=$2 AND actor_user_id=$3
               AND event_type='condition.set'
               AND occurred_at >= $4 AND occurred_at < $5
             ORDER BY occurred_at ASC",
        )
        .bind(&q.subject_type)
        .bind(&q.subject_id)
        .bind(actor)
        .bind(start)
        .bind(end)
        .fetch_all(&app.pool)
        .await
        .or_internal("phase query failed")?;
        (base, within)
    } else {
        let base = sqlx::query(
            "SELECT condition_id, occurred_at, payload FROM telemetry_event
             WHERE subject_type=$1 AND subject_id=$2
               AND event_type='condition.set' AND occurred_at < $3
             ORDER BY occurred_at DESC LIMIT 1",
        )
        .bind(&q.subject_type)
        .bind(&q.subject_id)
        .bind(start)
        .fetch_optional(&app.pool)
        .await
        .or_internal("phase query failed")?;
        let within = sqlx::query(
            "SELECT condition_id, occurred_at, payload FROM telemetry_event
             WHERE subject_type=$1 AND subject_id=$2
               AND event_type='condition.set'
               AND occurred_at >= $3 AND occurred_at < $4
             ORDER BY occurred_at ASC",
        )
        .bind(&q.subject_type)
        .bind(&q.subject_id)
        .bind(start)
        .bind(end)
        .fetch_all(&app.pool)
        .await
        .or_internal("phase query failed")?;
        (base, within)
    };

    let mut seq = Vec::new();
    if let Some(b) = base {
        seq.push(b);
    }
    seq.extend(within);

    let mut phases: Vec<JsonValue> = Vec::new();
    for (i, row) in seq.iter().enumerate() {
        let cid: Option<String> = row.get("condition_id");
        let st: DateTime<Utc> = row.get("occurred_at");
        let next = seq.get(i + 1).map(|r| r.get::<DateTime<Utc>, _>("occurred_at"));
        let payload: JsonValue = row.get::<Option<JsonValue>, _>("payload").unwrap_or(json!({}));
        let label = payload
            .get("label")
            .or_else(|| payload.get("phase"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| cid.clone());

        phases.push(json!({
            "condition_id": cid,
            "label": label,
            "start_ts": st.to_rfc3339(),
            "end_ts": next.map(|t| t.to_rfc3339()),
        }));
    }

    Ok(Json(json!({
        "metric_key": q.metric_key,
        "subject": {"subject_type": q.subject_type, "subject_id": q.subject_id},
        "points": points,
        "phases": phases,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_registry_covers_known_keys() {
        for key in [
            "probe_overall",
            "hallucination_rate",
            "concession_rate",
            "clarification_rate",
            "style_drift",
            "refusal_rate",
        ] {
            assert!(metric_expr(key).is_some(), "missing metric {key}");
        }
        assert!(metric_expr("nope").is_none());
    }

    #[test]
    fn timestamp_parsing_accepts_z_suffix() {
        assert!(parse_ts("2026-07-01T00:00:00Z").is_some());
        assert!(parse_ts("2026-07-01T00:00:00+02:00").is_some());
        assert!(parse_ts("").is_none());
        assert!(parse_ts("yesterday").is_none());
    }
}
