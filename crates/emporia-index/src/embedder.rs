use async_trait::async_trait;
use serde_json::json;

use crate::{IndexError, IndexResult};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

/// Turns text into fixed-length vectors. The dimensionality is fixed per
/// deployment; implementations must reject anything else.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed_one(&self, text: &str) -> IndexResult<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimension,
            client: reqwest::Client::new(),
        }
    }

    async fn request_embeddings(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;

        if !status.is_success() {
            let detail = value
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("embedding request failed with status {status}"));
            return Err(IndexError::Embedding(detail));
        }

        let data = value
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IndexError::Embedding("response missing data array".to_string()))?;

        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|v| v.as_array())
                .ok_or_else(|| IndexError::Embedding("item missing embedding".to_string()))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect::<Vec<f32>>();
            if embedding.len() != self.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimension,
                    got: embedding.len(),
                });
            }
            out.push(embedding);
        }
        if out.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                out.len()
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_one(&self, text: &str) -> IndexResult<Vec<f32>> {
        let mut vectors = self.request_embeddings(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| IndexError::Embedding("no embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(texts).await
    }
}
