//! Embedding providers.
//!
//! Every backend (remote server, local ONNX model, hashing stub) sits behind
//! [`EmbeddingProvider`], so the knowledge base never knows which one it has.

mod cache;
mod hash;
mod http;
mod onnx;

pub use cache::CachedEmbeddingProvider;
pub use hash::HashEmbeddingProvider;
pub use http::{HealthResponse, HttpEmbeddingProvider, InstructionType};
pub use onnx::OnnxEmbeddingProvider;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::models::{EmbeddingConfig, EmbeddingDriver};

/// Turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one document chunk.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a search query. Defaults to [`embed`](Self::embed).
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }

    /// Embed several texts, preserving order.
    ///
    /// The default calls [`embed`](Self::embed) sequentially; backends with
    /// native batching override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Identifier recorded in document metadata.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Drop any cached embeddings. No-op for uncached providers.
    fn clear_cache(&self) {}
}

pub(crate) fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Build the configured provider, wrapped in a cache when enabled.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.driver {
        EmbeddingDriver::Http => Arc::new(HttpEmbeddingProvider::new(config)?),
        EmbeddingDriver::Onnx => {
            let model_dir = config.model_path.as_deref().ok_or_else(|| {
                EmbeddingError::ModelError("embedding.model_path is required for onnx".into())
            })?;
            Arc::new(OnnxEmbeddingProvider::load(config, model_dir)?)
        }
        EmbeddingDriver::Hash => Arc::new(HashEmbeddingProvider::new(config.dimension as usize)),
    };

    tracing::debug!(
        driver = %config.driver,
        model = provider.model_id(),
        cache = config.cache,
        "embedding provider ready"
    );

    if config.cache {
        Ok(Arc::new(CachedEmbeddingProvider::new(provider)))
    } else {
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_factory_builds_hash_provider() {
        let config = EmbeddingConfig {
            dimension: 32,
            ..Default::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dimension(), 32);
        assert_eq!(provider.embed("hello").await.unwrap().len(), 32);
    }

    #[test]
    fn test_factory_requires_model_path_for_onnx() {
        let config = EmbeddingConfig {
            driver: EmbeddingDriver::Onnx,
            ..Default::default()
        };
        assert!(matches!(
            create_provider(&config),
            Err(EmbeddingError::ModelError(_))
        ));
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let provider = HashEmbeddingProvider::new(16);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(batch[0], provider.embed("alpha").await.unwrap());
        assert_eq!(batch[1], provider.embed("beta").await.unwrap());
    }
}
