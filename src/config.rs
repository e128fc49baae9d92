// src/config.rs
// Central configuration, read once from the environment at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Runtime configuration assembled from environment variables.
///
/// `POSTGRES_DSN` accepts both `postgres://` and `postgresql://`; sqlx wants
/// the latter, so we normalize on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    pub postgres_dsn: String,

    // Retrieval
    pub qdrant_url: String,
    pub embed_model: String,
    pub retrieval_collection: String,
    pub retrieve_top_k: usize,
    pub retrieve_threshold: Option<f32>,
    pub rag_corpus_primary: Vec<String>,
    pub rag_corpus_fallback: Vec<String>,
    pub rag_policy_ttl_seconds: u64,

    // Chat
    pub chat_model: String,
    pub feedback_model: String,

    // Scheduler
    pub vantage_id: String,

    // Vantage endpoints
    pub enable_vantage_endpoints: bool,
    pub vantage_model: Option<String>,
    pub vantage_debug: bool,
    pub vantage_personal_memory: bool,
    pub vantage_ritual_bypass: bool,
    pub vantage_greeting_bypass: bool,
    pub vantage_enforce_clarify_shape: bool,
    pub vantage_reentry_prefix: bool,

    // Voice relay
    pub voice_ws_token: Option<String>,
    pub xai_api_key: Option<String>,

    // Server
    pub host: String,
    pub port: u16,
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Normalize a Postgres DSN: sqlx rejects the `postgres://` scheme alias in
/// some environments, so standardize on `postgresql://`.
pub fn normalize_dsn(dsn: &str) -> String {
    if let Some(rest) = dsn.strip_prefix("postgres://") {
        format!("postgresql://{rest}")
    } else {
        dsn.to_string()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            postgres_dsn: normalize_dsn(&env_str("POSTGRES_DSN", "")),
            qdrant_url: env_str("QDRANT_URL", "http://127.0.0.1:6333"),
            embed_model: env_str("EMBED_MODEL", "text-embedding-3-large"),
            retrieval_collection: env_str("RETRIEVAL_COLLECTION", "corpus_default"),
            retrieve_top_k: env_str("RETRIEVE_TOP_K", "8").parse().unwrap_or(8),
            retrieve_threshold: env_opt("RETRIEVE_THRESHOLD").and_then(|v| v.parse().ok()),
            rag_corpus_primary: env_csv("RAG_CORPUS_PRIMARY"),
            rag_corpus_fallback: env_csv("RAG_CORPUS_FALLBACK"),
            rag_policy_ttl_seconds: env_str("RAG_POLICY_TTL_SECONDS", "15").parse().unwrap_or(15),
            chat_model: env_str("CHAT_MODEL", "gpt-5.1"),
            feedback_model: env_str("FEEDBACK_MODEL", "gpt-4o-mini"),
            vantage_id: env_str("VANTAGE_ID", "default"),
            enable_vantage_endpoints: env_flag("ENABLE_VANTAGE_ENDPOINTS"),
            vantage_model: env_opt("VANTAGE_MODEL"),
            vantage_debug: env_flag("VANTAGE_DEBUG"),
            vantage_personal_memory: env_flag("VANTAGE_PERSONAL_MEMORY"),
            vantage_ritual_bypass: env_flag("VANTAGE_RITUAL_BYPASS"),
            vantage_greeting_bypass: env_flag("VANTAGE_GREETING_BYPASS"),
            vantage_enforce_clarify_shape: env_flag("VANTAGE_ENFORCE_CLARIFY_SHAPE"),
            vantage_reentry_prefix: env_flag("VANTAGE_REENTRY_PREFIX"),
            voice_ws_token: env_opt("VOICE_WS_TOKEN"),
            xai_api_key: env_opt("XAI_API_KEY"),
            host: env_str("HOST", "0.0.0.0"),
            port: env_str("PORT", "8088").parse().unwrap_or(8088),
        }
    }

    /// Load a `.env`-style file if `POSTGRES_DSN` is not already set, then
    /// build the config. Values already in the environment win.
    pub fn load(env_file: Option<&str>) -> Self {
        if std::env::var("POSTGRES_DSN").is_err() {
            if let Some(path) = env_file {
                if Path::new(path).exists() {
                    let _ = dotenvy::from_path(path);
                }
            } else {
                let _ = dotenvy::dotenv();
            }
        }
        Self::from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_postgres_scheme() {
        assert_eq!(
            normalize_dsn("postgres://u:p@localhost:5432/memory"),
            "postgresql://u:p@localhost:5432/memory"
        );
        assert_eq!(
            normalize_dsn("postgresql://u:p@localhost/db"),
            "postgresql://u:p@localhost/db"
        );
    }
}
