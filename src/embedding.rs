//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two concrete implementations:
//! - **[`CompletionEmbedder`]** — calls the local completion service's
//!   embedding endpoint over HTTP.
//! - **[`HashedEmbedder`]** — a deterministic bag-of-words fallback that
//!   needs no network; used in tests and in air-gapped setups.
//!
//! Also provides vector utilities:
//! - [`l2_normalize`] — scale a vector to unit length
//! - [`cosine_similarity`] — similarity between two vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB encoding for
//!   SQLite storage
//!
//! All embeddings handed to the vector index are L2-normalized first, so
//! cosine similarity reduces to a dot product at search time.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::{CompletionConfig, EmbeddingConfig};

/// Text-to-vector transform. Implementations must produce vectors of
/// exactly `dim()` components.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn model_name(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Instantiate the embedder selected by configuration.
pub fn create_embedder(
    embedding: &EmbeddingConfig,
    completion: &CompletionConfig,
) -> Result<Box<dyn Embedder>> {
    match embedding.provider.as_str() {
        "completion" => Ok(Box::new(CompletionEmbedder::new(embedding, completion)?)),
        "hashed" => Ok(Box::new(HashedEmbedder::new(embedding.dim))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Completion-service provider ============

/// Embedding provider backed by the completion service's
/// `POST /api/embeddings` endpoint.
pub struct CompletionEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dim: usize,
    timeout: Duration,
}

impl CompletionEmbedder {
    pub fn new(embedding: &EmbeddingConfig, completion: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: completion.endpoint.trim_end_matches('/').to_string(),
            model: embedding.model.clone(),
            dim: embedding.dim,
            timeout: Duration::from_secs(embedding.timeout_secs),
        })
    }
}

#[async_trait]
impl Embedder for CompletionEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        // Single attempt: embedding calls are never retried at this layer;
        // failed index writes go through the reconciliation queue instead.
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.endpoint))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("embedding endpoint returned {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let mut vec = parse_embedding_response(&json)?;
        if vec.len() != self.dim {
            bail!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                vec.len()
            );
        }
        l2_normalize(&mut vec);
        Ok(vec)
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let arr = json
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing embedding array"))?;

    Ok(arr
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Hashed provider ============

/// Deterministic bag-of-words embedding: each lowercased token is hashed
/// into one of `dim` buckets. Shared vocabulary produces positive cosine
/// similarity, which is all the tests and offline setups need.
pub struct HashedEmbedder {
    dim: usize,
}

impl HashedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "hashed"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) as usize) % self.dim;
            vec[bucket] += 1.0;
        }
        l2_normalize(&mut vec);
        Ok(vec)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ============ Vector utilities ============

/// Scale `vec` to unit length. Zero vectors are left unchanged.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn hashed_embedder_is_deterministic() {
        let embedder = HashedEmbedder::new(384);
        let a = embedder.embed("Brot Milch Käse").await.unwrap();
        let b = embedder.embed("Brot Milch Käse").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[tokio::test]
    async fn hashed_embedder_shared_tokens_score_positive() {
        let embedder = HashedEmbedder::new(384);
        let doc = embedder
            .embed("Receipt from REWE Items: Brot; Milch")
            .await
            .unwrap();
        let query = embedder.embed("Brot").await.unwrap();
        assert!(cosine_similarity(&doc, &query) > 0.0);

        let unrelated = embedder.embed("xyzzy").await.unwrap();
        assert!(cosine_similarity(&doc, &unrelated).abs() < 1e-6);
    }
}
