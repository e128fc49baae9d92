// src/llm/mod.rs
// Embedding + chat-completion adapter over OpenAI-compatible providers.
//
// Model strings route by prefix:
//   "gpt-5.1"            -> provider "openai"
//   "xai:grok-2"         -> provider "xai", model "grok-2"
//   "groq:llama-3.3-70b" -> provider "groq", model "llama-3.3-70b"
//
// API keys come from <PROVIDER>_API_KEY, base URLs may be overridden with
// <PROVIDER>_BASE_URL.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider '{0}' and no {0}_BASE_URL set")]
    UnknownProvider(String),
    #[error("missing API key for provider '{provider}'; set {key_env}")]
    MissingKey { provider: String, key_env: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned no choices")]
    EmptyResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Text-in, vector-out capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Messages-in, text-out capability.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> Result<String, ProviderError>;

    async fn chat_simple(
        &self,
        system_prompt: &str,
        user_message: &str,
        model: &str,
    ) -> Result<String, ProviderError> {
        self.chat(
            &[ChatMessage::system(system_prompt), ChatMessage::user(user_message)],
            model,
        )
        .await
    }
}

/// Split "provider:model" into its parts; bare model names default to openai.
pub fn split_model(model: &str) -> (String, String) {
    if let Some((prov, name)) = model.split_once(':') {
        let prov = prov.trim().to_ascii_lowercase();
        let name = name.trim();
        if !prov.is_empty() && !name.is_empty() {
            return (prov, name.to_string());
        }
    }
    let name = if model.trim().is_empty() { "gpt-5.1" } else { model.trim() };
    ("openai".to_string(), name.to_string())
}

fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "fireworks" => Some("https://api.fireworks.ai/inference/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "perplexity" => Some("https://api.perplexity.ai"),
        "deepseek" => Some("https://api.deepseek.com"),
        _ => None,
    }
}

fn resolve_provider(provider: &str) -> Result<(String, String), ProviderError> {
    let base_env = format!("{}_BASE_URL", provider.to_ascii_uppercase());
    let key_env = format!("{}_API_KEY", provider.to_ascii_uppercase());

    let base_url = std::env::var(&base_env)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| default_base_url(provider).map(String::from))
        .ok_or_else(|| ProviderError::UnknownProvider(provider.to_string()))?;

    let api_key = std::env::var(&key_env)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ProviderError::MissingKey {
            provider: provider.to_string(),
            key_env: key_env.clone(),
        })?;

    Ok((base_url.trim_end_matches('/').to_string(), api_key))
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Reqwest-backed client for all configured providers.
pub struct LlmClient {
    http: reqwest::Client,
    embed_model: String,
}

impl LlmClient {
    pub fn new(embed_model: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { http, embed_model: embed_model.to_string() }
    }
}

#[async_trait]
impl Embedder for LlmClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let (provider, model) = split_model(&self.embed_model);
        let (base_url, api_key) = resolve_provider(&provider)?;

        let resp: EmbeddingsResponse = self
            .http
            .post(format!("{base_url}/embeddings"))
            .bearer_auth(api_key)
            .json(&EmbeddingsRequest { model: &model, input: text })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(ProviderError::EmptyResponse)
    }
}

#[async_trait]
impl ChatProvider for LlmClient {
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> Result<String, ProviderError> {
        let (provider, model_name) = split_model(model);
        let (base_url, api_key) = resolve_provider(&provider)?;
        debug!(provider = %provider, model = %model_name, "chat completion");

        let resp: ChatResponse = self
            .http
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(api_key)
            .json(&ChatRequest { model: &model_name, messages, temperature: 0.4, top_p: 1.0 })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ProviderError::EmptyResponse)
    }
}

/// Deterministic offline embedder: hashes the text into a fixed-dimension
/// unit vector. Property tests run fully offline with this injected.
pub struct HashEmbedder {
    pub dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dim: 64 }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut out = vec![0f32; self.dim];
        let mut counter: u32 = 0;
        let mut filled = 0;
        while filled < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if filled >= self.dim {
                    break;
                }
                let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out[filled] = (v as f32 / u32::MAX as f32) * 2.0 - 1.0;
                filled += 1;
            }
            counter += 1;
        }
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-9);
        for v in &mut out {
            *v /= norm;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_routing_defaults_to_openai() {
        assert_eq!(split_model("gpt-5.1"), ("openai".into(), "gpt-5.1".into()));
        assert_eq!(split_model("xai:grok-2"), ("xai".into(), "grok-2".into()));
        assert_eq!(split_model(""), ("openai".into(), "gpt-5.1".into()));
        // A dangling colon is not a provider prefix.
        assert_eq!(split_model("weird:"), ("openai".into(), "weird:".into()));
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("Coffee: yes").await.unwrap();
        let b = embedder.embed("Coffee: yes").await.unwrap();
        let c = embedder.embed("Coffee: no").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
