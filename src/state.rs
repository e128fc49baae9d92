// src/state.rs
// Shared application state: one pool, one vector store, one set of provider
// clients, initialized at process start and passed by Arc into handlers and
// the initiator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::llm::{ChatProvider, Embedder, LlmClient};
use crate::policy::PolicyStore;
use crate::retrieval::Retriever;
use crate::vector::{VectorStore, MEMORY_COLLECTION};

/// Last answer + personal memory ids, cached per conversation key so
/// feedback can resolve without a round trip when no answer_id is supplied.
#[derive(Debug, Clone, Default)]
pub struct LastResult {
    pub answer: String,
    pub memory_ids: Vec<String>,
    pub answer_id: Option<String>,
}

pub type RagKey = (String, String);
pub type VantageKey = (String, String, String);

pub struct AppState {
    pub config: Config,
    pub pool: PgPool,
    pub vector: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatProvider>,
    pub policy: Arc<PolicyStore>,
    pub last_rag_result: RwLock<HashMap<RagKey, LastResult>>,
    pub last_vantage_result: RwLock<HashMap<VantageKey, LastResult>>,
}

impl AppState {
    pub async fn new(config: Config, pool: PgPool) -> Result<Arc<Self>> {
        let vector = Arc::new(VectorStore::new(&config.qdrant_url)?);
        vector.ensure_collection(MEMORY_COLLECTION).await.ok();

        let llm = Arc::new(LlmClient::new(&config.embed_model));
        let embedder: Arc<dyn Embedder> = llm.clone();
        let chat: Arc<dyn ChatProvider> = llm;

        let policy = Arc::new(PolicyStore::new(pool.clone(), config.rag_policy_ttl_seconds));

        Ok(Arc::new(Self {
            config,
            pool,
            vector,
            embedder,
            chat,
            policy,
            last_rag_result: RwLock::new(HashMap::new()),
            last_vantage_result: RwLock::new(HashMap::new()),
        }))
    }

    pub fn retriever(&self) -> Retriever {
        Retriever {
            store: self.vector.clone(),
            embedder: self.embedder.clone(),
            policy: self.policy.clone(),
            corpus_primary_env: self.config.rag_corpus_primary.clone(),
            corpus_fallback_env: self.config.rag_corpus_fallback.clone(),
            default_threshold: self.config.retrieve_threshold,
        }
    }
}

/// Normalized cache key for the rag path: invalid thread ids collapse to "".
pub fn rag_key(user_id: &str, thread_id: Option<&str>) -> RagKey {
    let uid = non_empty(user_id, "anon");
    let tid = thread_id
        .map(str::trim)
        .filter(|t| uuid::Uuid::parse_str(t).is_ok())
        .unwrap_or("")
        .to_string();
    (uid, tid)
}

/// Cache key for the vantage path, additionally scoped by vantage id.
pub fn vantage_key(user_id: &str, thread_id: Option<&str>, vantage_id: Option<&str>) -> VantageKey {
    let (uid, tid) = rag_key(user_id, thread_id);
    let vid = non_empty(vantage_id.unwrap_or(""), "default");
    (uid, tid, vid)
}

fn non_empty(value: &str, default: &str) -> String {
    let v = value.trim();
    if v.is_empty() { default.to_string() } else { v.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_ids() {
        assert_eq!(rag_key("", None), ("anon".to_string(), String::new()));
        assert_eq!(rag_key("kea", Some("not-a-uuid")), ("kea".to_string(), String::new()));

        let tid = "6a4f2b9e-8f2a-4c11-9e58-7f6b42a3c001";
        assert_eq!(rag_key("kea", Some(tid)), ("kea".to_string(), tid.to_string()));

        assert_eq!(
            vantage_key("kea", None, None),
            ("kea".to_string(), String::new(), "default".to_string())
        );
        assert_eq!(
            vantage_key("kea", Some(tid), Some("lab")),
            ("kea".to_string(), tid.to_string(), "lab".to_string())
        );
    }
}
