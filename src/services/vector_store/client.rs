//! Resilient client over a [`VectorStore`] backend.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use super::resilience::{BreakerConfig, CircuitBreaker, CircuitState, ConnectionManager};
use super::{VectorStore, create_backend};
use crate::error::VectorStoreError;
use crate::models::{
    Collection, CollectionStats, Config, DeleteSelector, DistanceMetric, MetadataFilter,
    QueryMatch, RecordPage, ResilienceConfig, VectorDriver, VectorRecord,
};

const STATS_PAGE_SIZE: usize = 500;

/// Typed access to a vector store with retry, circuit breaking and a
/// collection handle registry.
///
/// Every remote call goes breaker -> connection manager -> backend. The
/// registry is only a reuse cache; the store's own create-if-absent
/// semantics are authoritative. Each name has its own cell, so a slow
/// creation only holds up callers of that same collection.
pub struct VectorStoreClient {
    backend: Arc<dyn VectorStore>,
    connection: ConnectionManager,
    breaker: CircuitBreaker,
    collections: Mutex<HashMap<String, Arc<OnceCell<Collection>>>>,
}

impl VectorStoreClient {
    pub fn new(backend: Arc<dyn VectorStore>, resilience: &ResilienceConfig) -> Self {
        Self::with_parts(
            backend,
            ConnectionManager::from_config(resilience),
            BreakerConfig::from(resilience),
        )
    }

    pub fn with_parts(
        backend: Arc<dyn VectorStore>,
        connection: ConnectionManager,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            backend,
            connection,
            breaker: CircuitBreaker::new(breaker),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Build the configured backend and wrap it.
    pub fn from_config(config: &Config) -> Result<Self, VectorStoreError> {
        let backend = create_backend(&config.vector_store, u64::from(config.embedding.dimension))?;
        Ok(Self::new(backend, &config.resilience))
    }

    pub fn driver(&self) -> VectorDriver {
        self.backend.driver()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        collection: &str,
        call: F,
    ) -> Result<T, VectorStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VectorStoreError>>,
    {
        let result = self.breaker.call(|| self.connection.execute(call)).await;

        match &result {
            Err(e @ VectorStoreError::CircuitOpen { .. }) => {
                tracing::warn!(operation, collection, error = %e, "rejected by open circuit");
            }
            Err(e @ VectorStoreError::StoreUnavailable { .. }) => {
                tracing::error!(operation, collection, error = %e, "vector store unavailable");
            }
            Err(VectorStoreError::CollectionNotFound(_)) => {
                tracing::debug!(operation, collection, "collection missing, evicting handle");
                self.collections.lock().await.remove(collection);
            }
            Err(e) => {
                tracing::debug!(operation, collection, error = %e, "vector store call failed");
            }
            Ok(_) => {}
        }
        result
    }

    /// Return the cached handle or create the collection (cosine metric).
    pub async fn get_or_create_collection(
        &self,
        name: &str,
    ) -> Result<Collection, VectorStoreError> {
        let cell = {
            let mut registry = self.collections.lock().await;
            registry.entry(name.to_string()).or_default().clone()
        };

        // Concurrent first access to one name shares a single create call; a
        // failed creation leaves the cell empty for the next caller.
        cell.get_or_try_init(|| self.create_collection(name))
            .await?;
        cell.get()
            .cloned()
            .ok_or_else(|| VectorStoreError::CollectionNotInitialized(name.to_string()))
    }

    async fn create_collection(&self, name: &str) -> Result<Collection, VectorStoreError> {
        let result = self
            .breaker
            .call(|| {
                self.connection.execute(|| {
                    self.backend
                        .get_or_create_collection(name, DistanceMetric::Cosine)
                })
            })
            .await;

        match &result {
            Ok(collection) => {
                tracing::debug!(collection = name, id = ?collection.id, "collection ready");
            }
            Err(e @ VectorStoreError::CircuitOpen { .. }) => {
                tracing::warn!(collection = name, error = %e, "rejected by open circuit");
            }
            Err(e) => {
                tracing::error!(collection = name, error = %e, "failed to open collection");
            }
        }
        result
    }

    /// Store a batch of records in one call.
    pub async fn add_records(
        &self,
        collection: &Collection,
        records: &[VectorRecord],
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.guarded("add", &collection.name, || {
            self.backend.add(collection, records)
        })
        .await
    }

    pub async fn query(
        &self,
        collection: &Collection,
        embedding: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>, VectorStoreError> {
        let filter = filter.filter(|f| !f.is_empty());
        self.guarded("query", &collection.name, || {
            self.backend.query(collection, embedding, limit, filter)
        })
        .await
    }

    pub async fn get_records(
        &self,
        collection: &Collection,
        filter: Option<&MetadataFilter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError> {
        let filter = filter.filter(|f| !f.is_empty());
        self.guarded("get", &collection.name, || {
            self.backend.get(collection, filter, limit, cursor)
        })
        .await
    }

    pub async fn delete_records(
        &self,
        collection: &Collection,
        selector: &DeleteSelector,
    ) -> Result<(), VectorStoreError> {
        match selector {
            DeleteSelector::Ids(ids) if ids.is_empty() => return Ok(()),
            DeleteSelector::Filter(f) if f.is_empty() => {
                return Err(VectorStoreError::InvalidRequest(
                    "delete filter must not be empty".to_string(),
                ));
            }
            _ => {}
        }
        self.guarded("delete", &collection.name, || {
            self.backend.delete(collection, selector)
        })
        .await
    }

    pub async fn count(&self, collection: &Collection) -> Result<u64, VectorStoreError> {
        self.guarded("count", &collection.name, || self.backend.count(collection))
            .await
    }

    /// Record count plus document-level aggregates from a metadata scan.
    pub async fn stats(
        &self,
        collection: &Collection,
    ) -> Result<CollectionStats, VectorStoreError> {
        let count = self.count(collection).await?;

        let mut documents: HashSet<String> = HashSet::new();
        let mut total_size_bytes = 0u64;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .get_records(collection, None, STATS_PAGE_SIZE, cursor.as_deref())
                .await?;

            for record in page.records {
                let Some(doc_id) = record.metadata.get("document_id").and_then(|v| v.as_str())
                else {
                    continue;
                };
                if documents.insert(doc_id.to_string()) {
                    total_size_bytes += record
                        .metadata
                        .get("file_size")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(CollectionStats {
            count,
            document_count: documents.len() as u64,
            total_size_bytes,
        })
    }

    /// Drop the collection and its cached handle.
    pub async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
        let mut registry = self.collections.lock().await;
        registry.remove(name);
        drop(registry);

        self.guarded("delete_collection", name, || {
            self.backend.delete_collection(name)
        })
        .await
    }

    /// Liveness check; never errors.
    pub async fn health_check(&self) -> bool {
        match self
            .guarded("heartbeat", "", || self.backend.heartbeat())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "vector store heartbeat failed");
                false
            }
        }
    }

    pub async fn cached_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .lock()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vector_store::InMemoryVectorStore;
    use crate::services::vector_store::memory::tests::record;
    use crate::utils::RetryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn client(backend: Arc<dyn VectorStore>) -> VectorStoreClient {
        VectorStoreClient::with_parts(
            backend,
            ConnectionManager::new(
                RetryConfig::new(1).with_initial_delay(Duration::from_millis(1)),
            ),
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(30),
            },
        )
    }

    /// Counts creations and fails every data call with a transient error.
    #[derive(Default)]
    struct FlakyStore {
        creates: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn heartbeat(&self) -> Result<(), VectorStoreError> {
            Err(VectorStoreError::ConnectionError("refused".into()))
        }

        async fn get_or_create_collection(
            &self,
            name: &str,
            metric: DistanceMetric,
        ) -> Result<Collection, VectorStoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Collection::new(name, metric))
        }

        async fn delete_collection(&self, _: &str) -> Result<bool, VectorStoreError> {
            Ok(true)
        }

        async fn add(&self, _: &Collection, _: &[VectorRecord]) -> Result<(), VectorStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(VectorStoreError::ConnectionError("refused".into()))
        }

        async fn query(
            &self,
            _: &Collection,
            _: &[f32],
            _: usize,
            _: Option<&MetadataFilter>,
        ) -> Result<Vec<QueryMatch>, VectorStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(VectorStoreError::ServerError {
                status: 503,
                message: "busy".into(),
            })
        }

        async fn get(
            &self,
            _: &Collection,
            _: Option<&MetadataFilter>,
            _: usize,
            _: Option<&str>,
        ) -> Result<RecordPage, VectorStoreError> {
            Ok(RecordPage::default())
        }

        async fn delete(&self, _: &Collection, _: &DeleteSelector) -> Result<(), VectorStoreError> {
            Ok(())
        }

        async fn count(&self, _: &Collection) -> Result<u64, VectorStoreError> {
            Err(VectorStoreError::CollectionNotFound("gone".into()))
        }

        fn driver(&self) -> VectorDriver {
            VectorDriver::Http
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_once() {
        let store = Arc::new(FlakyStore::default());
        let client = client(store.clone());

        let (a, b, c) = tokio::join!(
            client.get_or_create_collection("kb_u1_kb1"),
            client.get_or_create_collection("kb_u1_kb1"),
            client.get_or_create_collection("kb_u1_kb1"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(client.cached_collections().await, vec!["kb_u1_kb1"]);
    }

    /// Never finishes creating collections whose name starts with `kb_slow`.
    #[derive(Default)]
    struct SlowCreateStore {
        inner: InMemoryVectorStore,
        slow_started: AtomicBool,
    }

    #[async_trait]
    impl VectorStore for SlowCreateStore {
        async fn heartbeat(&self) -> Result<(), VectorStoreError> {
            self.inner.heartbeat().await
        }

        async fn get_or_create_collection(
            &self,
            name: &str,
            metric: DistanceMetric,
        ) -> Result<Collection, VectorStoreError> {
            if name.starts_with("kb_slow") {
                self.slow_started.store(true, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            self.inner.get_or_create_collection(name, metric).await
        }

        async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
            self.inner.delete_collection(name).await
        }

        async fn add(&self, c: &Collection, r: &[VectorRecord]) -> Result<(), VectorStoreError> {
            self.inner.add(c, r).await
        }

        async fn query(
            &self,
            c: &Collection,
            e: &[f32],
            n: usize,
            f: Option<&MetadataFilter>,
        ) -> Result<Vec<QueryMatch>, VectorStoreError> {
            self.inner.query(c, e, n, f).await
        }

        async fn get(
            &self,
            c: &Collection,
            f: Option<&MetadataFilter>,
            limit: usize,
            cursor: Option<&str>,
        ) -> Result<RecordPage, VectorStoreError> {
            self.inner.get(c, f, limit, cursor).await
        }

        async fn delete(&self, c: &Collection, s: &DeleteSelector) -> Result<(), VectorStoreError> {
            self.inner.delete(c, s).await
        }

        async fn count(&self, c: &Collection) -> Result<u64, VectorStoreError> {
            self.inner.count(c).await
        }

        fn driver(&self) -> VectorDriver {
            VectorDriver::Memory
        }
    }

    #[tokio::test]
    async fn test_slow_creation_does_not_block_other_collections() {
        let store = Arc::new(SlowCreateStore::default());
        let client = Arc::new(client(store.clone()));
        client.get_or_create_collection("kb_fast").await.unwrap();

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.get_or_create_collection("kb_slow").await })
        };
        while !store.slow_started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let cached = tokio::time::timeout(
            Duration::from_secs(2),
            client.get_or_create_collection("kb_fast"),
        )
        .await;
        assert!(matches!(cached, Ok(Ok(_))));

        let fresh = tokio::time::timeout(
            Duration::from_secs(2),
            client.get_or_create_collection("kb_other"),
        )
        .await;
        assert!(matches!(fresh, Ok(Ok(_))));
        assert_eq!(
            client.cached_collections().await,
            vec!["kb_fast", "kb_other"]
        );

        slow.abort();
    }

    #[tokio::test]
    async fn test_stats_follows_scan_cursor_across_pages() {
        let client = client(Arc::new(InMemoryVectorStore::new()));
        let col = client.get_or_create_collection("kb_big").await.unwrap();
        let records: Vec<_> = (0..(STATS_PAGE_SIZE as u32 * 2 + 7))
            .map(|i| record(&format!("d{}", i % 3), i, vec![1.0]))
            .collect();
        client.add_records(&col, &records).await.unwrap();

        let stats = client.stats(&col).await.unwrap();
        assert_eq!(stats.count, records.len() as u64);
        assert_eq!(stats.document_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_store_unavailable_then_circuit_opens() {
        let store = Arc::new(FlakyStore::default());
        let client = client(store.clone());
        let col = client.get_or_create_collection("kb_x").await.unwrap();

        for _ in 0..2 {
            let err = client.add_records(&col, &[record("d", 0, vec![1.0])]).await;
            assert!(matches!(
                err,
                Err(VectorStoreError::StoreUnavailable { attempts: 2, .. })
            ));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let err = client.query(&col, &[1.0], 5, None).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::CircuitOpen { .. }));
        assert!(err.is_unavailable());
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_not_found_evicts_cached_handle() {
        let store = Arc::new(FlakyStore::default());
        let client = client(store.clone());
        let col = client.get_or_create_collection("kb_gone").await.unwrap();

        assert!(client.count(&col).await.is_err());
        assert!(client.cached_collections().await.is_empty());

        client.get_or_create_collection("kb_gone").await.unwrap();
        assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_is_boolean() {
        let memory = client(Arc::new(InMemoryVectorStore::new()));
        assert!(memory.health_check().await);

        let flaky = client(Arc::new(FlakyStore::default()));
        assert!(!flaky.health_check().await);
    }

    #[tokio::test]
    async fn test_round_trip_query_returns_own_record_first() {
        let client = client(Arc::new(InMemoryVectorStore::new()));
        let col = client.get_or_create_collection("kb_rt").await.unwrap();
        let records = vec![
            record("d1", 0, vec![0.9, 0.1, 0.0]),
            record("d1", 1, vec![0.1, 0.9, 0.0]),
            record("d2", 0, vec![0.0, 0.2, 0.8]),
        ];
        client.add_records(&col, &records).await.unwrap();

        for r in &records {
            let matches = client.query(&col, &r.embedding, 3, None).await.unwrap();
            assert_eq!(matches[0].id, r.id);
            assert!(matches[0].distance.abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_stats_aggregates_documents() {
        let client = client(Arc::new(InMemoryVectorStore::new()));
        let col = client.get_or_create_collection("kb_s").await.unwrap();
        let records = vec![
            record("d1", 0, vec![1.0]),
            record("d1", 1, vec![1.0]),
            record("d2", 0, vec![1.0]),
        ];
        client.add_records(&col, &records).await.unwrap();

        let stats = client.stats(&col).await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.total_size_bytes, 200);
    }

    #[tokio::test]
    async fn test_empty_filter_delete_rejected() {
        let client = client(Arc::new(InMemoryVectorStore::new()));
        let col = client.get_or_create_collection("kb_d").await.unwrap();
        let result = client
            .delete_records(&col, &DeleteSelector::Filter(MetadataFilter::new()))
            .await;
        assert!(matches!(result, Err(VectorStoreError::InvalidRequest(_))));
    }
}
