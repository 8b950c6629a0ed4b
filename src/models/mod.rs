mod collection;
mod config;
mod document;
mod search;

pub use collection::{
    Collection, CollectionStats, DeleteSelector, DistanceMetric, MetadataFilter, QueryMatch,
    RecordPage, StoredRecord,
};
pub use config::{
    Config, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL, DEFAULT_EMBEDDING_URL,
    DEFAULT_METRICS_RETENTION_DAYS, DEFAULT_STORE_URL, EmbeddingConfig, EmbeddingDriver,
    HybridConfig, IndexingConfig, MetricsConfig, ResilienceConfig, SearchConfig, TailPolicy,
    VectorDriver, VectorStoreConfig,
};
pub use document::{
    ChunkMetadata, DocumentMetadata, DocumentUpload, DocumentUploadResult,
    EMBEDDING_SCHEMA_VERSION, ProcessingStatus, TextChunk, VectorRecord,
};
pub use search::{
    DEFAULT_SEARCH_LIMIT, DEFAULT_SIMILARITY_THRESHOLD, KnowledgeBaseStats, OutputFormat,
    SearchOptions, SearchResult, rank_results,
};
