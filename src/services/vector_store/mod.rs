//! Vector store abstraction layer.
//!
//! [`VectorStore`] is the raw collection/record model of a vector database;
//! backends implement it per wire protocol. [`VectorStoreClient`] layers the
//! collection handle registry, retry and circuit breaking on top.

mod client;
mod http;
pub(crate) mod memory;
mod qdrant;
mod resilience;

pub use client::VectorStoreClient;
pub use http::HttpVectorStore;
pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantBackend;
pub use resilience::{BreakerConfig, CircuitBreaker, CircuitState, ConnectionManager};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::VectorStoreError;
use crate::models::{
    Collection, DeleteSelector, DistanceMetric, MetadataFilter, QueryMatch, RecordPage,
    VectorDriver, VectorRecord, VectorStoreConfig,
};

/// Operations every vector store backend provides.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Liveness check.
    async fn heartbeat(&self) -> Result<(), VectorStoreError>;

    /// Create the collection if absent and return a handle to it.
    async fn get_or_create_collection(
        &self,
        name: &str,
        metric: DistanceMetric,
    ) -> Result<Collection, VectorStoreError>;

    /// Drop a collection and all its records. Returns false if it did not exist.
    async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError>;

    /// Insert or replace records by id.
    async fn add(
        &self,
        collection: &Collection,
        records: &[VectorRecord],
    ) -> Result<(), VectorStoreError>;

    /// Nearest neighbours of `embedding`, closest first.
    async fn query(
        &self,
        collection: &Collection,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>, VectorStoreError>;

    /// Page through stored records without embeddings, starting at `cursor`
    /// (the beginning when `None`).
    async fn get(
        &self,
        collection: &Collection,
        filter: Option<&MetadataFilter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError>;

    async fn delete(
        &self,
        collection: &Collection,
        selector: &DeleteSelector,
    ) -> Result<(), VectorStoreError>;

    async fn count(&self, collection: &Collection) -> Result<u64, VectorStoreError>;

    fn driver(&self) -> VectorDriver;
}

/// Create a vector store backend based on configuration.
///
/// `dimension` is only used by backends that size collections up front.
pub fn create_backend(
    config: &VectorStoreConfig,
    dimension: u64,
) -> Result<Arc<dyn VectorStore>, VectorStoreError> {
    match config.driver {
        VectorDriver::Http => Ok(Arc::new(HttpVectorStore::new(config)?)),
        VectorDriver::Qdrant => Ok(Arc::new(QdrantBackend::new(config, dimension)?)),
        VectorDriver::Memory => Ok(Arc::new(InMemoryVectorStore::new())),
    }
}
