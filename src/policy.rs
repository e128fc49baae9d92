// src/policy.rs
// Per-vantage retrieval policy stored in vantage_identity.rag_policy, with a
// short TTL cache in front of reads. DB values override env defaults.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct RagPolicy {
    pub corpus_primary: Vec<String>,
    pub corpus_fallback: Vec<String>,
    pub topic_overrides: HashMap<String, TopicOverride>,
    pub deny_collections: Vec<String>,
    pub allow_collections: Vec<String>,
    /// Raw policy JSON as stored, echoed back by the policy endpoints.
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Default)]
pub struct TopicOverride {
    pub corpus_primary: Option<Vec<String>>,
    pub corpus_fallback: Option<Vec<String>>,
}

fn str_list(v: Option<&JsonValue>) -> Vec<String> {
    v.and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|x| x.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn opt_str_list(v: Option<&JsonValue>) -> Option<Vec<String>> {
    v.filter(|v| v.is_array()).map(|v| str_list(Some(v)))
}

impl RagPolicy {
    pub fn from_json(raw: JsonValue) -> Self {
        let topic_overrides = raw
            .get("topic_overrides")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, ov)| {
                        (
                            k.clone(),
                            TopicOverride {
                                corpus_primary: opt_str_list(ov.get("corpus_primary")),
                                corpus_fallback: opt_str_list(ov.get("corpus_fallback")),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            corpus_primary: str_list(raw.get("corpus_primary")),
            corpus_fallback: str_list(raw.get("corpus_fallback")),
            deny_collections: str_list(raw.get("deny_collections")),
            allow_collections: str_list(raw.get("allow_collections")),
            topic_overrides,
            raw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.as_object().map(|o| o.is_empty()).unwrap_or(true)
    }
}

struct CacheEntry {
    at: Instant,
    policy: RagPolicy,
}

/// TTL-cached policy reader. A TTL of zero disables caching.
pub struct PolicyStore {
    pool: PgPool,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl PolicyStore {
    pub fn new(pool: PgPool, ttl_seconds: u64) -> Self {
        Self {
            pool,
            ttl: Duration::from_secs(ttl_seconds),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, vantage_id: &str) -> RagPolicy {
        let vid = if vantage_id.trim().is_empty() { "default" } else { vantage_id.trim() };

        if !self.ttl.is_zero() {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(vid) {
                if entry.at.elapsed() <= self.ttl {
                    return entry.policy.clone();
                }
            }
        }

        let policy = match self.fetch(vid).await {
            Ok(p) => p,
            Err(e) => {
                warn!(vid = %vid, "rag_policy fetch failed: {}", e);
                RagPolicy::default()
            }
        };

        if !self.ttl.is_zero() {
            let mut cache = self.cache.write().await;
            cache.insert(vid.to_string(), CacheEntry { at: Instant::now(), policy: policy.clone() });
        }

        policy
    }

    async fn fetch(&self, vantage_id: &str) -> Result<RagPolicy> {
        let row: Option<(JsonValue,)> =
            sqlx::query_as("SELECT policy FROM vantage_identity.rag_policy WHERE vantage_id=$1")
                .bind(vantage_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(policy,)| RagPolicy::from_json(policy))
            .unwrap_or_default())
    }

    pub async fn upsert(&self, vantage_id: &str, policy: &JsonValue) -> Result<RagPolicy> {
        sqlx::query(
            "INSERT INTO vantage_identity.rag_policy(vantage_id, policy, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (vantage_id) DO UPDATE SET policy=EXCLUDED.policy, updated_at=now()",
        )
        .bind(vantage_id)
        .bind(policy)
        .execute(&self.pool)
        .await?;

        // Invalidate so the next read observes the new policy immediately.
        self.cache.write().await.remove(vantage_id);

        Ok(RagPolicy::from_json(policy.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_policy_shape() {
        let pol = RagPolicy::from_json(json!({
            "corpus_primary": ["fm_axioms", "hv_axioms"],
            "corpus_fallback": ["misc"],
            "deny_collections": ["scratch"],
            "topic_overrides": {
                "topic:workout": {"corpus_primary": ["workout_db"]}
            }
        }));
        assert_eq!(pol.corpus_primary, vec!["fm_axioms", "hv_axioms"]);
        assert_eq!(pol.corpus_fallback, vec!["misc"]);
        assert_eq!(pol.deny_collections, vec!["scratch"]);
        let ov = pol.topic_overrides.get("topic:workout").unwrap();
        assert_eq!(ov.corpus_primary.as_deref(), Some(&["workout_db".to_string()][..]));
        assert!(ov.corpus_fallback.is_none());
        assert!(!pol.is_empty());
    }

    #[test]
    fn empty_policy_is_empty() {
        assert!(RagPolicy::from_json(json!({})).is_empty());
        assert!(RagPolicy::default().is_empty());
    }
}
