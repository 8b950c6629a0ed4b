use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{EmbeddingProvider, normalize};
use crate::error::EmbeddingError;
use crate::utils::terms;

/// Deterministic bag-of-words embedder using the hashing trick.
///
/// Each lower-cased term is hashed into one of `dimension` buckets with a
/// hash-derived sign. Texts sharing vocabulary land close together, which is
/// enough for offline use and tests; it carries no semantics beyond that.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
    model_id: String,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hash-bow-{}", dimension),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for term in terms(text) {
            let digest = Sha256::digest(term.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vectorize(text))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
