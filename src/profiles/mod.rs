// src/profiles/mod.rs
// Long-term behavioral profiles aggregated into singleton cards.

pub mod desire;
pub mod gravity;

use chrono::{SecondsFormat, Utc};

/// ISO-8601 UTC timestamp with a trailing Z, the form stored in payloads.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Collect `payload.tags` as strings.
pub fn payload_tags(payload: &serde_json::Value) -> Vec<String> {
    payload
        .get("tags")
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

/// Read feedback counters from a payload.
pub fn payload_feedback(payload: &serde_json::Value) -> (i64, i64) {
    let fb = payload.get("feedback");
    let pos = fb
        .and_then(|f| f.get("positive_signals"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let neg = fb
        .and_then(|f| f.get("negative_signals"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    (pos, neg)
}
