pub mod chunker;
pub mod embedding;
pub mod hybrid;
pub mod keyword;
pub mod knowledge_base;
pub mod metrics;
pub mod vector_store;

pub use chunker::{ChunkingOptions, TextChunker, chunk_text};
pub use embedding::{
    CachedEmbeddingProvider, EmbeddingProvider, HashEmbeddingProvider, HttpEmbeddingProvider,
    OnnxEmbeddingProvider, create_provider,
};
pub use hybrid::HybridSearchEngine;
pub use keyword::{KeywordHit, KeywordIndex, TantivyKeywordIndex};
pub use knowledge_base::{KnowledgeBaseService, collection_name};
pub use metrics::{MetricsStore, MetricsSummary, Operation};
pub use vector_store::{
    BreakerConfig, CircuitBreaker, CircuitState, ConnectionManager, InMemoryVectorStore,
    VectorStore, VectorStoreClient, create_backend,
};
