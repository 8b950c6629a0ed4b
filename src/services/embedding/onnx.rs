//! Local ONNX embedding model.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};

use super::{EmbeddingProvider, normalize};
use crate::error::EmbeddingError;
use crate::models::EmbeddingConfig;

const QUERY_INSTRUCTION: &str =
    "Instruct: Given a search query, retrieve relevant passages\nQuery: ";

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
}

fn model_err(e: impl std::fmt::Display) -> EmbeddingError {
    EmbeddingError::ModelError(e.to_string())
}

impl OnnxModel {
    fn load(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, EmbeddingError> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(EmbeddingError::ModelError(format!(
                "model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(model_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_err)?
            .with_intra_threads(num_cpus())
            .map_err(model_err)?
            .commit_from_file(&model_path)
            .map_err(model_err)?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(model_err)?;

        // Chunks beyond the model's context would otherwise blow up memory
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_tokens as usize,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(model_err)?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension: config.dimension as usize,
        })
    }

    fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let processed: Vec<String> = if is_query {
            texts
                .iter()
                .map(|t| format!("{}{}", QUERY_INSTRUCTION, t))
                .collect()
        } else {
            texts.to_vec()
        };

        let encodings = self
            .tokenizer
            .encode_batch(processed, true)
            .map_err(model_err)?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        let batch_size = encodings.len();

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let mut position_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for (j, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = m as i64;
                position_ids[i * max_len + j] = j as i64;
            }
        }

        let shape = [batch_size, max_len];
        let input_ids = Tensor::from_array((shape, input_ids)).map_err(model_err)?;
        let attention_mask = Tensor::from_array((shape, attention_mask)).map_err(model_err)?;
        let position_ids = Tensor::from_array((shape, position_ids)).map_err(model_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbeddingError::ModelError("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input_ids, attention_mask, position_ids])
            .map_err(model_err)?;

        let output = outputs[0].try_extract_array::<f32>().map_err(model_err)?;

        // Last-token pooling for sequence outputs, pass-through for pooled outputs
        match output.shape().len() {
            3 => Ok((0..batch_size)
                .map(|i| {
                    let last_idx = encodings[i].get_ids().len().saturating_sub(1);
                    let embedding: Vec<f32> = (0..self.dimension)
                        .map(|d| output[[i, last_idx, d]])
                        .collect();
                    normalize(&embedding)
                })
                .collect()),
            2 => Ok((0..batch_size)
                .map(|i| {
                    let embedding: Vec<f32> = (0..self.dimension).map(|d| output[[i, d]]).collect();
                    normalize(&embedding)
                })
                .collect()),
            _ => Err(EmbeddingError::ModelError(format!(
                "unexpected output shape: {:?}",
                output.shape()
            ))),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Embedding provider running an ONNX model in-process.
///
/// Inference is CPU-bound, so each call is moved onto the blocking pool.
#[derive(Clone)]
pub struct OnnxEmbeddingProvider {
    model: Arc<OnnxModel>,
    model_id: String,
}

impl OnnxEmbeddingProvider {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn load(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, EmbeddingError> {
        let model = OnnxModel::load(config, model_dir)?;
        Ok(Self {
            model: Arc::new(model),
            model_id: config.model_id.clone(),
        })
    }

    async fn run(
        &self,
        texts: Vec<String>,
        is_query: bool,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(&texts, is_query))
            .await
            .map_err(|e| EmbeddingError::ModelError(format!("inference task failed: {}", e)))?
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.run(vec![text.to_string()], false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("model returned no embedding".into()))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.run(vec![text.to_string()], true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("model returned no embedding".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.run(texts.to_vec(), false).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.model.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxEmbeddingProvider::load(&EmbeddingConfig::default(), dir.path())
            .err()
            .unwrap();
        assert!(err.to_string().contains("model not found"));
    }
}
