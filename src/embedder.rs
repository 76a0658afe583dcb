//! Embedding capability.
//!
//! The core treats embedding as an opaque asynchronous function
//! `embed(text) -> f32[d]` with a batch variant. The production implementation
//! talks to an OpenAI-compatible `/embeddings` endpoint; tests swap in a
//! deterministic in-process double through the same trait.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Items per embedding request. Bounded by the context window of the
/// configured embedder, not by anything on our side.
pub const EMBED_BATCH_SIZE: usize = 25;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut out = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        out.pop()
            .ok_or_else(|| AppError::Embedding("embedder returned no vectors".to_string()))
    }
}

/// OpenAI-compatible embeddings client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch = texts.len(), model = %self.model, "embedding batch");

        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Embedding(format!("embedding request failed: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Embedding(format!(
                "embedding endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Embedding(format!("malformed embedding response: {}", e)))?;
        if parsed.data.len() != texts.len() {
            return Err(AppError::Embedding(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}
