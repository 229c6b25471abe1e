//! Embedding strategy trait and vector utilities.
//!
//! Defines the [`Embedder`] trait the retrieval index embeds through,
//! the deterministic [`HashEmbedder`] placeholder, and cosine similarity.
//!
//! Network-backed embedders (OpenAI, Ollama) live in the `narrative-forge`
//! app crate. Production deployments must supply one of those (or their
//! own [`Embedder`]); the placeholder only captures lexical overlap.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::chunk::is_cjk;
use crate::error::{Error, Result};

pub const DEFAULT_HASH_DIMS: usize = 256;

/// Strategy for turning text into a fixed-dimension vector.
///
/// Only [`embed`](Embedder::embed) is required; the metadata methods
/// feed index statistics.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str {
        "custom"
    }

    /// Returns the vector dimensionality, if known up front.
    fn dims(&self) -> Option<usize> {
        None
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase latin word and each CJK character is hashed with
/// SHA-256 into one of `dims` buckets with a hash-derived sign; the
/// result is L2-normalized. Identical texts always produce identical
/// vectors, and texts sharing vocabulary score higher, but the vectors
/// carry no semantics beyond that.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn features(text: &str) -> Vec<String> {
        let mut features = Vec::new();
        let mut word = String::new();
        for c in text.chars() {
            if is_cjk(c) {
                if !word.is_empty() {
                    features.push(std::mem::take(&mut word));
                }
                features.push(c.to_string());
            } else if c.is_alphanumeric() {
                word.extend(c.to_lowercase());
            } else if !word.is_empty() {
                features.push(std::mem::take(&mut word));
            }
        }
        if !word.is_empty() {
            features.push(word);
        }
        features
    }

    /// Synchronous embedding, used by the async trait method.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn model_name(&self) -> &str {
        "hash-placeholder"
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Zero-magnitude or empty vectors score `0.0`.
///
/// # Errors
///
/// [`Error::DimensionMismatch`] if the vectors differ in length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
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
        return Ok(0.0);
    }

    Ok(dot / denom)
}
