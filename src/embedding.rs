//! Network embedding providers.
//!
//! Implements the core [`Embedder`] trait for:
//! - **`hash`**: the deterministic [`HashEmbedder`] placeholder (default; no network).
//! - **[`OpenAiEmbedder`]**: the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the provider named in the
//! `[embedding]` config section:
//!
//! ```rust,no_run
//! # use narrative_forge::config::EmbeddingConfig;
//! # use narrative_forge::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "hash-placeholder");
//! ```
//!
//! # Retry Strategy
//!
//! Both HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use narrative_forge_core::embedding::{Embedder, HashEmbedder, DEFAULT_HASH_DIMS};
use narrative_forge_core::Error;

use crate::config::EmbeddingConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Shared HTTP settings for the network providers.
struct HttpEmbedding {
    client: reqwest::Client,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl HttpEmbedding {
    fn new(config: &EmbeddingConfig, provider: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", provider))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url`, retrying rate limits, server and network errors.
    async fn post_with_retry(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
        label: &str,
    ) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(provider = label, attempt, delay = ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = bearer {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
    }

    fn check_dims(&self, vector: Vec<f32>) -> narrative_forge_core::Result<Vec<f32>> {
        if vector.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    http: HttpEmbedding,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpEmbedding::new(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self { http, api_key })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> narrative_forge_core::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.http.model,
            "input": [text],
        });
        let vector = self
            .http
            .post_with_retry(OPENAI_EMBEDDINGS_URL, Some(&self.api_key), &body, "OpenAI")
            .await
            .and_then(|json| parse_openai_response(&json))
            .and_then(first_vector)
            .map_err(|e| Error::Embedding(format!("{e:#}")))?;
        self.http.check_dims(vector)
    }

    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> Option<usize> {
        Some(self.http.dims)
    }
}

/// Embedder backed by a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    http: HttpEmbedding,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpEmbedding::new(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self { http, url })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> narrative_forge_core::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.http.model,
            "input": [text],
        });
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let vector = self
            .http
            .post_with_retry(&endpoint, None, &body, "Ollama")
            .await
            .and_then(|json| parse_ollama_response(&json))
            .and_then(first_vector)
            .map_err(|e| Error::Embedding(format!("{e:#}")))?;
        self.http.check_dims(vector)
    }

    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> Option<usize> {
        Some(self.http.dims)
    }
}

fn first_vector(vectors: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

fn to_vector(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Parse `data[].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    data.iter()
        .map(|item| {
            item.get("embedding")
                .and_then(|e| e.as_array())
                .map(|e| to_vector(e))
                .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))
        })
        .collect()
}

/// Parse `embeddings[]` from an Ollama `/api/embed` response.
fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|e| to_vector(e))
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_response() {
        let json = json!({"data": [{"embedding": [0.5, -1.0]}, {"embedding": [1.0, 2.0]}]});
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![0.5, -1.0], vec![1.0, 2.0]]);
        assert!(parse_openai_response(&json!({"object": "list"})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({"model": "nomic-embed-text", "embeddings": [[0.25, 0.75]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.25, 0.75]]);
        assert!(parse_ollama_response(&json!({"embeddings": [1.0]})).is_err());
    }

    #[tokio::test]
    async fn test_create_hash_embedder_uses_configured_dims() {
        let config = EmbeddingConfig {
            dims: Some(32),
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.dims(), Some(32));
        assert_eq!(embedder.embed("harbor").await.unwrap().len(), 32);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_ollama_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = create_embedder(&config).err().unwrap();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[tokio::test]
    async fn test_unreachable_ollama_reports_embedding_error() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(4),
            url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            timeout_secs: 2,
        };
        let embedder = create_embedder(&config).unwrap();
        let err = embedder.embed("harbor").await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }
}
