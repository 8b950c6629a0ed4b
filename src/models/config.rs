use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::search::{DEFAULT_SEARCH_LIMIT, DEFAULT_SIMILARITY_THRESHOLD, OutputFormat};
use crate::error::ConfigError;
use crate::services::ChunkingOptions;

pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_EMBEDDING_MODEL: &str = "hash-bow";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 384;
pub const DEFAULT_STORE_URL: &str = "http://localhost:8000";
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 30;

const APP_DIR: &str = "ragkb";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR).join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join(APP_DIR))
    }

    pub fn metrics_db_path() -> Option<PathBuf> {
        Self::data_dir().map(|p| p.join("metrics.db"))
    }

    /// Load the user config (or defaults), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            ConfigError::PathError("could not determine config directory".to_string())
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RAGKB_STORE_URL") {
            self.vector_store.url = url;
        }
        if let Ok(driver) = std::env::var("RAGKB_STORE_DRIVER")
            && let Ok(driver) = driver.parse()
        {
            self.vector_store.driver = driver;
        }
        if let Ok(key) = std::env::var("RAGKB_STORE_API_KEY") {
            self.vector_store.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("RAGKB_EMBEDDING_URL") {
            self.embedding.url = url;
        }
        if let Ok(driver) = std::env::var("RAGKB_EMBEDDING_DRIVER")
            && let Ok(driver) = driver.parse()
        {
            self.embedding.driver = driver;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ChunkingOptions::from(&self.indexing)
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("indexing: {}", e)))?;
        if self.embedding.dimension == 0 {
            return Err(ConfigError::ValidationError(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.resilience.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        let h = &self.search.hybrid;
        if [h.semantic_weight, h.keyword_weight, h.recency_weight]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(ConfigError::ValidationError(
                "hybrid weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which embedding implementation to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDriver {
    /// Remote embedding server speaking the `/embed` protocol
    Http,
    /// Local ONNX model
    Onnx,
    /// Deterministic hashing embedder (tests, offline use)
    #[default]
    Hash,
}

impl std::str::FromStr for EmbeddingDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(EmbeddingDriver::Http),
            "onnx" => Ok(EmbeddingDriver::Onnx),
            "hash" => Ok(EmbeddingDriver::Hash),
            _ => Err(format!("unknown embedding driver: {}", s)),
        }
    }
}

impl std::fmt::Display for EmbeddingDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingDriver::Http => write!(f, "http"),
            EmbeddingDriver::Onnx => write!(f, "onnx"),
            EmbeddingDriver::Hash => write!(f, "hash"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub driver: EmbeddingDriver,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    #[serde(default = "default_dimension")]
    pub dimension: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Cache embeddings by exact text content
    #[serde(default = "default_true")]
    pub cache: bool,
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_max_tokens() -> u32 {
    512
}

fn default_timeout() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    8
}

fn default_embedding_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            driver: EmbeddingDriver::default(),
            url: default_embedding_url(),
            model_id: default_embedding_model(),
            model_path: None,
            dimension: default_dimension(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout(),
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            cache: true,
        }
    }
}

/// Which vector store backend to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDriver {
    /// REST vector database (collections / add / query / delete / count / heartbeat)
    #[default]
    Http,
    /// Qdrant over gRPC
    Qdrant,
    /// Process-local store, lost on exit
    Memory,
}

impl std::str::FromStr for VectorDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "rest" => Ok(VectorDriver::Http),
            "qdrant" => Ok(VectorDriver::Qdrant),
            "memory" => Ok(VectorDriver::Memory),
            _ => Err(format!("unknown vector store driver: {}", s)),
        }
    }
}

impl std::fmt::Display for VectorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorDriver::Http => write!(f, "http"),
            VectorDriver::Qdrant => write!(f, "qdrant"),
            VectorDriver::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub driver: VectorDriver,

    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_store_timeout() -> u64 {
    30
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            driver: VectorDriver::default(),
            url: default_store_url(),
            api_key: None,
            timeout_secs: default_store_timeout(),
        }
    }
}

/// Retry and circuit-breaker settings for vector store calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl ResilienceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// What to do with a trailing buffer smaller than `min_chunk_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Append to the previous chunk (or emit alone if that would exceed the ceiling)
    #[default]
    Merge,
    /// Drop the tail
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    #[serde(default)]
    pub tail_policy: TailPolicy,

    /// Chunks embedded concurrently per document
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,

    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_chunk_size() -> usize {
    512
}

fn default_overlap_size() -> usize {
    50
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_chunk_size() -> usize {
    1024
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
        "**/.venv/**".to_string(),
        "**/*.lock".to_string(),
    ]
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            tail_policy: TailPolicy::default(),
            embed_concurrency: default_embed_concurrency(),
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// Weights for the hybrid relevance score.
///
/// The weights need not sum to 1; with the defaults the best possible
/// composite score is 1.1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,

    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,

    /// Semantic similarity assumed for results found only by keyword
    #[serde(default)]
    pub keyword_only_similarity: f32,

    /// Days over which the recency score decays linearly to zero
    #[serde(default = "default_recency_horizon_days")]
    pub recency_horizon_days: f64,
}

fn default_semantic_weight() -> f32 {
    0.7
}

fn default_keyword_weight() -> f32 {
    0.3
}

fn default_recency_weight() -> f32 {
    0.1
}

fn default_recency_horizon_days() -> f64 {
    365.0
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            recency_weight: default_recency_weight(),
            keyword_only_similarity: 0.0,
            recency_horizon_days: default_recency_horizon_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,

    #[serde(default)]
    pub default_format: OutputFormat,

    #[serde(default)]
    pub hybrid: HybridConfig,
}

fn default_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            similarity_threshold: default_threshold(),
            default_format: OutputFormat::Text,
            hybrid: HybridConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    DEFAULT_METRICS_RETENTION_DAYS
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.embedding.url, DEFAULT_EMBEDDING_URL);
        assert_eq!(config.vector_store.url, DEFAULT_STORE_URL);
        assert_eq!(config.vector_store.driver, VectorDriver::Http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.is_some());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [vector_store]
            driver = "qdrant"
            url = "http://qdrant:6334"

            [indexing]
            chunk_size = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.vector_store.driver, VectorDriver::Qdrant);
        assert_eq!(config.indexing.chunk_size, 256);
        assert_eq!(config.indexing.overlap_size, 50);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.search.hybrid.semantic_weight, 0.7);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.indexing.chunk_size = 300;
        config.vector_store.driver = VectorDriver::Memory;

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_inverted_sizes() {
        let mut config = Config::default();
        config.indexing.min_chunk_size = 600;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.indexing.overlap_size = 512;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.indexing.max_chunk_size = 0;
        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => {
                assert_eq!(msg, "indexing: max_chunk_size must be greater than zero");
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }

        let mut config = Config::default();
        config.search.hybrid.keyword_weight = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!("REST".parse::<VectorDriver>().unwrap(), VectorDriver::Http);
        assert_eq!(
            "onnx".parse::<EmbeddingDriver>().unwrap(),
            EmbeddingDriver::Onnx
        );
        assert!("faiss".parse::<VectorDriver>().is_err());
    }
}
