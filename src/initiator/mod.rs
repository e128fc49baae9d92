// src/initiator/mod.rs
// The Initiator: a polling scheduler that reads per-vantage controller
// config, samples drives, enqueues singleton jobs, claims queued work under
// exclusive locks, runs it, and records outcomes. Multiple workers may share
// the queue; the claim protocol (per-vantage admission lock + row-lock skip)
// gives exactly-one delivery.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};

use crate::cards::consolidate::card_consolidate_from_kv_once;
use crate::cards::decay::{card_decay_once, DecayParams};
use crate::facts;

pub const DEFAULT_STALE_RUNNING_SECONDS: i64 = 3600;
pub const DEFAULT_SEED_BACKLOG_CAP: i64 = 25;
pub const DEFAULT_SEED_LIMIT: i64 = 5;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub vantage_id: String,
    pub enabled: bool,
    pub tick_seconds: i64,
    pub max_jobs_per_tick: i64,
    pub max_running_jobs: i64,
    pub daily_cost_budget_usd: f64,
    pub allowed_job_types: Vec<String>,
}

impl ControllerConfig {
    pub fn allows(&self, job_type: &str) -> bool {
        self.allowed_job_types.iter().any(|t| t == job_type)
    }
}

pub async fn fetch_controller_config(pool: &PgPool, vantage_id: &str) -> Result<ControllerConfig> {
    let row = sqlx::query(
        "SELECT vantage_id, enabled, tick_seconds, max_jobs_per_tick, max_running_jobs,
                daily_cost_budget_usd, allowed_job_types
         FROM vantage_initiator.controller_config
         WHERE vantage_id=$1",
    )
    .bind(vantage_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("Missing controller_config for vantage_id={vantage_id:?}"))?;

    let allowed_raw: JsonValue = row.get("allowed_job_types");
    let allowed_job_types = match allowed_raw {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect(),
        JsonValue::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };

    Ok(ControllerConfig {
        vantage_id: row.get("vantage_id"),
        enabled: row.get("enabled"),
        tick_seconds: row.get::<i32, _>("tick_seconds") as i64,
        max_jobs_per_tick: row.get::<i32, _>("max_jobs_per_tick") as i64,
        max_running_jobs: row.get::<i32, _>("max_running_jobs") as i64,
        daily_cost_budget_usd: row.get("daily_cost_budget_usd"),
        allowed_job_types,
    })
}

/// Queue and run statistics for this vantage: counts by status, oldest
/// queued age, oldest running-lock age, and 1-hour success/failure rates.
pub async fn compute_drives_v1(pool: &PgPool, vantage_id: &str) -> Result<JsonValue> {
    let row = sqlx::query(
        r#"SELECT
          (SELECT count(*) FROM vantage_initiator.job WHERE vantage_id=$1 AND status='queued')     AS queued,
          (SELECT count(*) FROM vantage_initiator.job WHERE vantage_id=$1 AND status='running')    AS running,
          (SELECT count(*) FROM vantage_initiator.job WHERE vantage_id=$1 AND status='succeeded')  AS succeeded,
          (SELECT count(*) FROM vantage_initiator.job WHERE vantage_id=$1 AND status='failed')     AS failed,

          (SELECT EXTRACT(EPOCH FROM (now() - min(scheduled_at)))::float8
             FROM vantage_initiator.job
            WHERE vantage_id=$1 AND status='queued') AS queued_oldest_age_s,

          (SELECT EXTRACT(EPOCH FROM (now() - min(locked_at)))::float8
             FROM vantage_initiator.job
            WHERE vantage_id=$1 AND status='running' AND locked_at IS NOT NULL) AS running_oldest_lock_age_s,

          (SELECT count(*)
             FROM vantage_initiator.job_run jr
             JOIN vantage_initiator.job j ON j.job_id = jr.job_id
            WHERE j.vantage_id=$1
              AND jr.finished_at >= now() - interval '1 hour'
              AND jr.error IS NULL) AS runs_ok_1h,

          (SELECT count(*)
             FROM vantage_initiator.job_run jr
             JOIN vantage_initiator.job j ON j.job_id = jr.job_id
            WHERE j.vantage_id=$1
              AND jr.finished_at >= now() - interval '1 hour'
              AND jr.error IS NOT NULL) AS runs_fail_1h"#,
    )
    .bind(vantage_id)
    .fetch_one(pool)
    .await?;

    Ok(json!({
        "mode": "drives_v1",
        "ts_unix": Utc::now().timestamp_millis() as f64 / 1000.0,
        "queued_jobs": row.get::<i64, _>("queued"),
        "running_jobs": row.get::<i64, _>("running"),
        "succeeded_jobs": row.get::<i64, _>("succeeded"),
        "failed_jobs": row.get::<i64, _>("failed"),
        "queued_oldest_age_s": row.get::<Option<f64>, _>("queued_oldest_age_s"),
        "running_oldest_lock_age_s": row.get::<Option<f64>, _>("running_oldest_lock_age_s"),
        "runs_ok_1h": row.get::<i64, _>("runs_ok_1h"),
        "runs_fail_1h": row.get::<i64, _>("runs_fail_1h"),
    }))
}

pub async fn insert_drive_snapshot(
    pool: &PgPool,
    vantage_id: &str,
    drives: &JsonValue,
    notes: &str,
) -> Result<i64> {
    let (snapshot_id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_initiator.drive_snapshot(vantage_id, drives, notes)
         VALUES ($1, $2, $3)
         RETURNING snapshot_id",
    )
    .bind(vantage_id)
    .bind(drives)
    .bind(notes)
    .fetch_one(pool)
    .await?;
    Ok(snapshot_id)
}

/// Enqueue a job iff no queued/running instance of this (vantage, type)
/// exists. This is the only duplicate-avoidance rule singleton jobs get.
pub async fn ensure_singleton_job(
    pool: &PgPool,
    vantage_id: &str,
    job_type: &str,
    payload: &JsonValue,
    priority: i32,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;

    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT job_id FROM vantage_initiator.job
         WHERE vantage_id=$1 AND job_type=$2 AND status IN ('queued','running')
         ORDER BY job_id DESC LIMIT 1",
    )
    .bind(vantage_id)
    .bind(job_type)
    .fetch_optional(&mut *tx)
    .await?;

    if existing.is_some() {
        tx.commit().await?;
        return Ok(None);
    }

    let (job_id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_initiator.job(job_type, vantage_id, payload, priority)
         VALUES ($1, $2, $3, $4)
         RETURNING job_id",
    )
    .bind(job_type)
    .bind(vantage_id)
    .bind(payload)
    .bind(priority)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(job_id))
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: i64,
    pub job_type: String,
    pub payload: JsonValue,
    pub run_id: i64,
}

/// Claim the next runnable job for this vantage, or None.
///
/// The transaction takes a per-vantage lock on controller_config first so
/// max_running_jobs is actually enforced across workers, then selects the
/// next queued job with a row lock that skips rows other workers hold. The
/// transaction commits (releasing both locks) before the job body runs.
pub async fn claim_one_job(
    pool: &PgPool,
    vantage_id: &str,
    worker_id: &str,
    before_drives: &JsonValue,
    allowed_job_types: &[String],
    max_running_jobs: i64,
) -> Result<Option<ClaimedJob>> {
    let allowed: Vec<String> = allowed_job_types
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if allowed.is_empty() {
        return Ok(None);
    }

    let mut tx = pool.begin().await?;

    sqlx::query("SELECT 1 FROM vantage_initiator.controller_config WHERE vantage_id=$1 FOR UPDATE")
        .bind(vantage_id)
        .execute(&mut *tx)
        .await?;

    let (running,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM vantage_initiator.job WHERE vantage_id=$1 AND status='running'",
    )
    .bind(vantage_id)
    .fetch_one(&mut *tx)
    .await?;
    if running >= max_running_jobs {
        tx.commit().await?;
        return Ok(None);
    }

    let row = sqlx::query(
        "SELECT job_id, job_type, payload
         FROM vantage_initiator.job
         WHERE status='queued'
           AND scheduled_at <= now()
           AND vantage_id=$1
           AND attempts < max_attempts
           AND job_type = ANY($2)
         ORDER BY priority ASC, scheduled_at ASC, job_id ASC
         FOR UPDATE SKIP LOCKED
         LIMIT 1",
    )
    .bind(vantage_id)
    .bind(&allowed)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let job_id: i64 = row.get("job_id");
    let job_type: String = row.get("job_type");
    let payload: JsonValue = row.get::<Option<JsonValue>, _>("payload").unwrap_or(json!({}));

    sqlx::query(
        "UPDATE vantage_initiator.job
            SET status='running',
                locked_by=$1,
                locked_at=now(),
                attempts=attempts+1,
                last_error=NULL
          WHERE job_id=$2",
    )
    .bind(worker_id)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    let (run_id,): (i64,) = sqlx::query_as(
        "INSERT INTO vantage_initiator.job_run(job_id, worker_id, before_drives)
         VALUES ($1, $2, $3)
         RETURNING run_id",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(before_drives)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedJob { job_id, job_type, payload, run_id }))
}

pub async fn finish_job_success(
    pool: &PgPool,
    job_id: i64,
    run_id: i64,
    after_drives: &JsonValue,
    outcome: &JsonValue,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE vantage_initiator.job
            SET status='succeeded', locked_by=NULL, locked_at=NULL, last_error=NULL
          WHERE job_id=$1",
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE vantage_initiator.job_run
            SET finished_at=now(), after_drives=$1, outcome=$2, error=NULL
          WHERE run_id=$3",
    )
    .bind(after_drives)
    .bind(outcome)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Requeue with linear backoff (`attempts * 10s`) while attempts remain,
/// otherwise mark the job failed. Always closes the run with the error.
pub async fn finish_job_failure(
    pool: &PgPool,
    job_id: i64,
    run_id: i64,
    after_drives: &JsonValue,
    error_text: &str,
) -> Result<()> {
    let err: String = error_text.chars().take(5000).collect();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE vantage_initiator.job
            SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                scheduled_at = CASE WHEN attempts < max_attempts
                                    THEN now() + (attempts * interval '10 seconds')
                                    ELSE scheduled_at END,
                locked_by=NULL,
                locked_at=NULL,
                last_error=$2
          WHERE job_id=$1",
    )
    .bind(job_id)
    .bind(&err)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE vantage_initiator.job_run
            SET finished_at=now(), after_drives=$1, outcome=NULL, error=$2
          WHERE run_id=$3",
    )
    .bind(after_drives)
    .bind(&err)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Move running jobs whose lock has gone stale back to the queue.
pub async fn reap_stale_running_jobs(
    pool: &PgPool,
    vantage_id: &str,
    stale_running_seconds: i64,
) -> Result<JsonValue> {
    let note = format!("reaped stale running job (locked_at older than {stale_running_seconds}s)");
    let row = sqlx::query(
        r#"WITH moved AS (
            UPDATE vantage_initiator.job
               SET status='queued',
                   scheduled_at=now(),
                   locked_by=NULL,
                   locked_at=NULL,
                   last_error=$3
             WHERE vantage_id=$1
               AND status='running'
               AND locked_at IS NOT NULL
               AND locked_at < now() - ($2::bigint * interval '1 second')
            RETURNING job_id
        )
        SELECT count(*) AS moved FROM moved"#,
    )
    .bind(vantage_id)
    .bind(stale_running_seconds)
    .bind(&note)
    .fetch_one(pool)
    .await?;

    let moved: i64 = row.get("moved");
    Ok(json!({"requeued_count": moved, "stale_running_seconds": stale_running_seconds}))
}

fn payload_i64(payload: &JsonValue, key: &str, default: i64) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

fn payload_f64(payload: &JsonValue, key: &str, default: f64) -> f64 {
    payload.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

/// Deterministic planner: keep the liveness job queued, enqueue a stale-lock
/// reaper when the oldest running lock is overdue, and keep the fact/card
/// loops fed according to their drive counters.
async fn enqueue_passes(
    pool: &PgPool,
    cfg: &ControllerConfig,
    payload: &JsonValue,
) -> Result<JsonValue> {
    let vantage_id = cfg.vantage_id.as_str();
    let drives = compute_drives_v1(pool, vantage_id).await?;
    let mut enqueued: Vec<JsonValue> = Vec::new();

    let mut push = |job_type: &str, job_id: Option<i64>, out: &mut Vec<JsonValue>| {
        if let Some(jid) = job_id {
            out.push(json!({"job_type": job_type, "job_id": jid}));
        }
    };

    if cfg.allows("heartbeat") {
        let jid = ensure_singleton_job(pool, vantage_id, "heartbeat", &json!({}), 100).await?;
        push("heartbeat", jid, &mut enqueued);
    }

    let stale_s = payload_i64(payload, "stale_running_seconds", DEFAULT_STALE_RUNNING_SECONDS);
    let oldest_lock = drives
        .get("running_oldest_lock_age_s")
        .and_then(|v| v.as_f64());
    if let Some(age) = oldest_lock {
        if age > stale_s as f64 && cfg.allows("reap_stale_jobs_v1") {
            let jid = ensure_singleton_job(
                pool,
                vantage_id,
                "reap_stale_jobs_v1",
                &json!({"stale_running_seconds": stale_s}),
                50,
            )
            .await?;
            push("reap_stale_jobs_v1", jid, &mut enqueued);
        }
    }

    if cfg.allows("card_decay_v1") {
        let jid = ensure_singleton_job(
            pool,
            vantage_id,
            "card_decay_v1",
            &json!({"limit_cards": 50, "half_life_days": 45.0, "signal_window_days": 180}),
            90,
        )
        .await?;
        push("card_decay_v1", jid, &mut enqueued);
    }

    if cfg.allows("card_consolidate_kv_v1") {
        let jid = ensure_singleton_job(
            pool,
            vantage_id,
            "card_consolidate_kv_v1",
            &json!({"limit_sources": 5}),
            60,
        )
        .await?;
        push("card_consolidate_kv_v1", jid, &mut enqueued);
    }

    let fact_types = [
        "fact_seed_from_chat_log_v1",
        "fact_drives_v1",
        "fact_extract_v1",
        "fact_contradiction_scan_v1",
    ];
    if fact_types.iter().any(|t| cfg.allows(t)) {
        let fdr = match facts::compute_fact_drives(pool).await {
            Ok(d) => d,
            Err(e) => json!({
                "pending_sources": 0,
                "active_claims": 0,
                "open_contradictions": 0,
                "error": e.to_string(),
            }),
        };

        let seed_enabled = cfg.allows("fact_seed_from_chat_log_v1");
        let pending_sources = fdr.get("pending_sources").and_then(|v| v.as_i64()).unwrap_or(0);
        let seed_backlog_cap = payload_i64(payload, "seed_backlog_cap", DEFAULT_SEED_BACKLOG_CAP);
        let seed_limit = payload_i64(payload, "seed_limit", DEFAULT_SEED_LIMIT);

        if seed_enabled && pending_sources < seed_backlog_cap {
            let jid = ensure_singleton_job(
                pool,
                vantage_id,
                "fact_seed_from_chat_log_v1",
                &json!({"limit": seed_limit}),
                23,
            )
            .await?;
            push("fact_seed_from_chat_log_v1", jid, &mut enqueued);
        }

        if cfg.allows("fact_drives_v1") {
            let jid = ensure_singleton_job(pool, vantage_id, "fact_drives_v1", &json!({}), 25).await?;
            push("fact_drives_v1", jid, &mut enqueued);
        }

        if cfg.allows("fact_extract_v1") && (pending_sources > 0 || seed_enabled) {
            let jid = ensure_singleton_job(pool, vantage_id, "fact_extract_v1", &json!({}), 30).await?;
            push("fact_extract_v1", jid, &mut enqueued);
        }

        let active_claims = fdr.get("active_claims").and_then(|v| v.as_i64()).unwrap_or(0);
        if cfg.allows("fact_contradiction_scan_v1") && active_claims > 0 {
            let jid = ensure_singleton_job(
                pool,
                vantage_id,
                "fact_contradiction_scan_v1",
                &json!({"max_groups": 10}),
                40,
            )
            .await?;
            push("fact_contradiction_scan_v1", jid, &mut enqueued);
        }
    }

    Ok(json!({
        "ok": true,
        "job_type": "enqueue_passes_v1",
        "enqueued": enqueued,
        "drives": drives,
    }))
}

/// Run one job body. Runs outside any claim transaction.
pub async fn process_job(
    pool: &PgPool,
    cfg: &ControllerConfig,
    job_type: &str,
    payload: &JsonValue,
) -> Result<JsonValue> {
    let vantage_id = cfg.vantage_id.as_str();

    match job_type {
        "heartbeat" => {
            let mut keys: Vec<String> = payload
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            keys.sort();
            Ok(json!({
                "ok": true,
                "job_type": "heartbeat",
                "ts_unix": Utc::now().timestamp_millis() as f64 / 1000.0,
                "payload_keys": keys,
            }))
        }

        "sense_drives_v1" => {
            let mut drives = compute_drives_v1(pool, vantage_id).await?;
            if let Some(obj) = drives.as_object_mut() {
                obj.insert("mode".into(), json!("sense_drives_v1"));
                obj.insert("controller_enabled".into(), json!(cfg.enabled));
                obj.insert("allowed_job_types".into(), json!(cfg.allowed_job_types));
            }
            let snapshot_id = insert_drive_snapshot(pool, vantage_id, &drives, "sense_drives_v1").await?;
            Ok(json!({"ok": true, "job_type": "sense_drives_v1", "snapshot_id": snapshot_id, "drives": drives}))
        }

        "enqueue_passes_v1" => enqueue_passes(pool, cfg, payload).await,

        "reap_stale_jobs_v1" => {
            let stale_s = payload_i64(payload, "stale_running_seconds", DEFAULT_STALE_RUNNING_SECONDS);
            let out = reap_stale_running_jobs(pool, vantage_id, stale_s).await?;
            let mut result = json!({"ok": true, "job_type": "reap_stale_jobs_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        "fact_drives_v1" => {
            let drives = facts::compute_fact_drives(pool).await?;
            let snapshot_id = insert_drive_snapshot(pool, vantage_id, &drives, "fact_drives_v1").await?;
            Ok(json!({"ok": true, "job_type": "fact_drives_v1", "snapshot_id": snapshot_id, "drives": drives}))
        }

        "fact_seed_from_chat_log_v1" => {
            let limit = payload_i64(payload, "limit", 50);
            let out = facts::fact_seed_from_chat_log_once(pool, vantage_id, limit).await?;
            let mut result = json!({"job_type": "fact_seed_from_chat_log_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        "fact_extract_v1" => {
            let max_facts = payload_i64(payload, "max_facts", 50) as usize;
            let out = facts::fact_extract_once(pool, max_facts).await?;
            let mut result = json!({"job_type": "fact_extract_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        "fact_contradiction_scan_v1" => {
            let max_groups = payload_i64(payload, "max_groups", 10);
            let out = facts::fact_contradiction_scan_once(pool, max_groups).await?;
            let mut result = json!({"job_type": "fact_contradiction_scan_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        "card_consolidate_kv_v1" => {
            let limit_sources = payload_i64(payload, "limit_sources", 5);
            let out = card_consolidate_from_kv_once(pool, vantage_id, limit_sources).await?;
            let mut result = json!({"job_type": "card_consolidate_kv_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        "card_decay_v1" => {
            let limit_cards = payload_i64(payload, "limit_cards", 50);
            let params = DecayParams {
                half_life_days: payload_f64(payload, "half_life_days", 45.0),
                signal_window_days: payload_i64(payload, "signal_window_days", 180),
                ..DecayParams::default()
            };
            let out = card_decay_once(pool, vantage_id, limit_cards, params).await?;
            let mut result = json!({"job_type": "card_decay_v1"});
            merge_into(&mut result, &out);
            Ok(result)
        }

        other => Err(anyhow!("Unknown job_type: {other:?}")),
    }
}

fn merge_into(dst: &mut JsonValue, src: &JsonValue) {
    if let (Some(d), Some(s)) = (dst.as_object_mut(), src.as_object()) {
        for (k, v) in s {
            d.insert(k.clone(), v.clone());
        }
    }
}

/// One scheduler tick for a vantage: snapshot drives, enqueue the controller
/// loop jobs, then claim and run up to max_jobs_per_tick.
pub async fn tick(pool: &PgPool, vantage_id: &str, worker_id: &str) -> Result<()> {
    let cfg = fetch_controller_config(pool, vantage_id).await?;

    // Always snapshot drives, even when disabled (observability).
    let mut before = compute_drives_v1(pool, vantage_id).await?;
    if let Some(obj) = before.as_object_mut() {
        obj.insert("controller_enabled".into(), json!(cfg.enabled));
        obj.insert("allowed_job_types".into(), json!(cfg.allowed_job_types));
    }
    let snapshot_id = insert_drive_snapshot(pool, vantage_id, &before, "tick(before)").await?;
    info!(snapshot_id, vantage_id = %vantage_id, "tick: drive snapshot");

    if !cfg.enabled {
        return Ok(());
    }

    // Controller loop jobs.
    if cfg.allows("sense_drives_v1") {
        if let Some(jid) = ensure_singleton_job(pool, vantage_id, "sense_drives_v1", &json!({}), 10).await? {
            info!(job_id = jid, "enqueue: sense_drives_v1");
        }
    }
    if cfg.allows("enqueue_passes_v1") {
        if let Some(jid) = ensure_singleton_job(pool, vantage_id, "enqueue_passes_v1", &json!({}), 20).await? {
            info!(job_id = jid, "enqueue: enqueue_passes_v1");
        }
    }
    // Liveness job.
    if cfg.allows("heartbeat") {
        if let Some(jid) = ensure_singleton_job(pool, vantage_id, "heartbeat", &json!({}), 100).await? {
            info!(job_id = jid, "enqueue: heartbeat");
        }
    }

    for _ in 0..cfg.max_jobs_per_tick.max(0) {
        let claimed = claim_one_job(
            pool,
            vantage_id,
            worker_id,
            &before,
            &cfg.allowed_job_types,
            cfg.max_running_jobs,
        )
        .await?;
        let Some(job) = claimed else { break };

        info!(job_id = job.job_id, job_type = %job.job_type, run_id = job.run_id, "claim");

        match process_job(pool, &cfg, &job.job_type, &job.payload).await {
            Ok(outcome) => {
                let after = compute_drives_v1(pool, vantage_id).await?;
                finish_job_success(pool, job.job_id, job.run_id, &after, &outcome).await?;
                info!(job_id = job.job_id, "finish: succeeded");
            }
            Err(e) => {
                let after = compute_drives_v1(pool, vantage_id)
                    .await
                    .unwrap_or_else(|_| json!({}));
                finish_job_failure(pool, job.job_id, job.run_id, &after, &format!("{e:#}")).await?;
                error!(job_id = job.job_id, "finish: failed: {:#}", e);
            }
        }
    }

    Ok(())
}

/// The worker identity recorded in job locks and runs.
pub fn worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}:{}", std::process::id())
}

/// Infinite tick loop. The tick interval is re-read from controller_config
/// on every iteration so config changes apply without a restart.
pub async fn run_loop(pool: PgPool, vantage_id: String) -> Result<()> {
    let worker = worker_id();
    info!(worker_id = %worker, vantage_id = %vantage_id, "initiator starting");

    loop {
        let tick_seconds = match fetch_controller_config(&pool, &vantage_id).await {
            Ok(cfg) => cfg.tick_seconds.max(1),
            Err(e) => {
                warn!("initiator: controller_config fetch failed: {:#}", e);
                60
            }
        };

        if let Err(e) = tick(&pool, &vantage_id, &worker).await {
            error!("initiator tick failed: {:#}", e);
        }

        tokio::time::sleep(Duration::from_secs(tick_seconds as u64)).await;
    }
}
