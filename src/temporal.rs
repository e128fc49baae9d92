// src/temporal.rs
// Time-gap bucketing and the re-entry line policy.

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize)]
pub struct TemporalInfo {
    pub seconds_since_last_user_message: Option<f64>,
    pub bucket: String,
}

/// Seconds since the most recent chat_log row for this user, per Postgres
/// timestamps.
pub async fn seconds_since_last_user_message(pool: &PgPool, user_id: &str) -> Option<f64> {
    let row: Option<(chrono::DateTime<Utc>,)> = sqlx::query_as(
        "SELECT created_at FROM chat_log WHERE user_id=$1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();

    let last = row?.0;
    let delta = Utc::now().signed_duration_since(last);
    Some(delta.num_milliseconds() as f64 / 1000.0)
}

pub async fn temporal_info(pool: &PgPool, user_id: &str) -> TemporalInfo {
    let secs = seconds_since_last_user_message(pool, user_id).await;
    TemporalInfo {
        seconds_since_last_user_message: secs,
        bucket: bucket_time_gap(secs).to_string(),
    }
}

pub fn bucket_time_gap(seconds: Option<f64>) -> &'static str {
    let Some(s) = seconds else { return "unknown" };
    if s < 300.0 {
        "very_recent"
    } else if s < 3600.0 {
        "recent"
    } else if s < 86400.0 {
        "same_day"
    } else if s < 7.0 * 86400.0 {
        "days_gap"
    } else {
        "long_gap"
    }
}

const TASK_MARKERS: &[&str] = &[
    "give me", "show me", "write", "generate", "make a", "draft",
    "steps", "step by step", "outline", "bulleted", "bullet",
    "code", "fix", "debug", "implement", "create",
];

const CONVERSATIONAL_MARKERS: &[&str] = &[
    "hey", "hi", "hello", "so", "anyway",
    "i was thinking", "i've been thinking", "i wanted to",
    "i feel", "it's been", "been a while", "catch up",
    "what's been going on", "how have you been",
];

/// Whether a short "it's been a while" line would feel natural.
/// Conservative: only for day-plus gaps, never on task requests.
pub fn should_add_reentry_line(bucket: &str, user_message: &str, query_tags: &[String]) -> bool {
    if bucket != "days_gap" && bucket != "long_gap" {
        return false;
    }

    let msg = user_message.trim().to_lowercase();
    if msg.is_empty() {
        return false;
    }

    if TASK_MARKERS.iter().any(|m| msg.contains(m)) {
        return false;
    }

    if query_tags.iter().any(|t| t == "intent:instruct" || t == "intent:generate") {
        return false;
    }

    CONVERSATIONAL_MARKERS.iter().any(|m| msg.contains(m))
}

pub fn build_reentry_line(bucket: &str) -> String {
    match bucket {
        "days_gap" => {
            "It's been a couple days since we last talked — what's been going on?\n\n".to_string()
        }
        "long_gap" => {
            "It's been a little while since we last talked — what's been going on?\n\n".to_string()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_time_gap(None), "unknown");
        assert_eq!(bucket_time_gap(Some(0.0)), "very_recent");
        assert_eq!(bucket_time_gap(Some(299.9)), "very_recent");
        assert_eq!(bucket_time_gap(Some(300.0)), "recent");
        assert_eq!(bucket_time_gap(Some(3599.0)), "recent");
        assert_eq!(bucket_time_gap(Some(3600.0)), "same_day");
        assert_eq!(bucket_time_gap(Some(86399.0)), "same_day");
        assert_eq!(bucket_time_gap(Some(86400.0)), "days_gap");
        assert_eq!(bucket_time_gap(Some(7.0 * 86400.0 - 1.0)), "days_gap");
        assert_eq!(bucket_time_gap(Some(7.0 * 86400.0)), "long_gap");
    }

    #[test]
    fn reentry_requires_conversational_gap() {
        assert!(should_add_reentry_line("days_gap", "hey, been a while", &[]));
        assert!(!should_add_reentry_line("recent", "hey, been a while", &[]));
        // Task requests never get a re-entry line.
        assert!(!should_add_reentry_line("long_gap", "hey, give me a workout outline", &[]));
        assert!(!should_add_reentry_line(
            "long_gap",
            "hello again",
            &["intent:generate".to_string()]
        ));
        // Non-conversational long-gap messages stay quiet too.
        assert!(!should_add_reentry_line("long_gap", "the quarterly numbers", &[]));
    }
}
