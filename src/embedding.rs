//! Embedding capability.
//!
//! A single swappable interface shared by the ingestion and query paths.
//! Both sides of one index generation must embed with the same model
//! version; the tag reported by [`Embedder::model_version`] is stamped onto
//! every index entry and checked again at query time.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::EngineError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Version tag identifying the embedding space.
    fn model_version(&self) -> &str;

    /// Output vector length.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// Batch embedding; output order and length mirror the input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// HTTP adapter for a llama.cpp-style embedding server.
pub struct LlamaServerEmbedder {
    client: reqwest::Client,
    base_url: String,
    model_version: String,
    dimension: usize,
}

impl LlamaServerEmbedder {
    pub fn new(base_url: impl Into<String>, model_version: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model_version: model_version.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for LlamaServerEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let url = format!("{}/embedding", self.base_url);
        let body = serde_json::json!({ "content": text });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transient("embedding", e))?;

        if !res.status().is_success() {
            return Err(EngineError::transient(
                "embedding",
                format!("server returned {}", res.status()),
            ));
        }

        let data: Value = res
            .json()
            .await
            .map_err(|e| EngineError::transient("embedding", e))?;
        let vector: Vec<f32> = serde_json::from_value(data["embedding"].clone())
            .map_err(|_| EngineError::internal("invalid embedding response"))?;

        if vector.len() != self.dimension {
            return Err(EngineError::Internal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

/// Deterministic bag-of-words feature-hashing embedder.
///
/// No model runtime required: each word hashes to a slot and the resulting
/// counts are L2-normalized, so texts sharing vocabulary score a higher
/// cosine. Backs tests and offline environments.
pub struct HashingEmbedder {
    dimension: usize,
    model_version: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_version: format!("feature-hash-{}", dimension),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

/// FNV-1a, fixed across platforms and releases so stored vectors stay valid.
fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl HashingEmbedder {
    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let slot = (fnv1a(&word.to_lowercase()) % self.dimension as u64) as usize;
            vector[slot] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}
