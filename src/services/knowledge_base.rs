//! Knowledge-base orchestration: ingestion, search and lifecycle per tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::watch;
use tracing::Instrument;

use crate::error::KnowledgeBaseError;
use crate::models::{
    ChunkMetadata, Collection, Config, DeleteSelector, DocumentMetadata, DocumentUpload,
    DocumentUploadResult, IndexingConfig, KnowledgeBaseStats, MetadataFilter, ProcessingStatus,
    SearchConfig, SearchOptions, SearchResult, VectorRecord, rank_results,
};
use crate::services::chunker::{ChunkingOptions, TextChunker};
use crate::services::embedding::{EmbeddingProvider, create_provider};
use crate::services::hybrid::HybridSearchEngine;
use crate::services::keyword::KeywordIndex;
use crate::services::metrics::{MetricsStore, Operation};
use crate::services::vector_store::VectorStoreClient;
use crate::utils::{calculate_checksum, sanitize_identifier};

const SCAN_PAGE_SIZE: usize = 500;

/// Collection backing one owner's knowledge base.
///
/// `"kb_" + lowercase(sanitize(owner + "_" + kb))`. Distinct pairs can collide
/// once sanitized: `("a_b", "c")` and `("a", "b_c")` both give `kb_a_b_c`.
pub fn collection_name(owner_id: &str, kb_name: &str) -> String {
    format!(
        "kb_{}",
        sanitize_identifier(&format!("{}_{}", owner_id, kb_name)).to_lowercase()
    )
}

fn validated_collection_name(owner_id: &str, kb_name: &str) -> Result<String, KnowledgeBaseError> {
    if owner_id.trim().is_empty() {
        return Err(KnowledgeBaseError::Validation(
            "owner id must not be empty".to_string(),
        ));
    }
    if kb_name.trim().is_empty() {
        return Err(KnowledgeBaseError::Validation(
            "knowledge base name must not be empty".to_string(),
        ));
    }
    Ok(collection_name(owner_id, kb_name))
}

fn completed_only(filters: &MetadataFilter) -> MetadataFilter {
    filters
        .clone()
        .merge(&MetadataFilter::new().eq("processing_status", ProcessingStatus::Completed.as_str()))
}

type InFlightRegistry = Mutex<HashMap<String, watch::Sender<bool>>>;

/// Cancellation signal registered for one in-flight document; unregisters on drop.
struct InFlight<'a> {
    registry: &'a InFlightRegistry,
    document_id: String,
    cancelled: watch::Receiver<bool>,
}

impl<'a> InFlight<'a> {
    fn register(
        registry: &'a InFlightRegistry,
        document_id: &str,
    ) -> Result<Self, KnowledgeBaseError> {
        let (tx, rx) = watch::channel(false);
        let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(document_id) {
            return Err(KnowledgeBaseError::Validation(format!(
                "document {} is already being processed",
                document_id
            )));
        }
        map.insert(document_id.to_string(), tx);
        Ok(Self {
            registry,
            document_id: document_id.to_string(),
            cancelled: rx,
        })
    }

    fn check(&self) -> Result<(), KnowledgeBaseError> {
        if *self.cancelled.borrow() {
            Err(KnowledgeBaseError::Cancelled(self.document_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    async fn cancelled(&self) -> KnowledgeBaseError {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone: the document can no longer be cancelled.
            std::future::pending::<()>().await;
        }
        KnowledgeBaseError::Cancelled(self.document_id.clone())
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.registry.lock() {
            map.remove(&self.document_id);
        }
    }
}

/// Chunks, embeds and stores documents per (owner, knowledge base) and answers
/// similarity queries against them.
///
/// Collaborators are injected; the service holds no process-wide state.
pub struct KnowledgeBaseService {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<VectorStoreClient>,
    chunker: TextChunker,
    embed_concurrency: usize,
    search: SearchConfig,
    hybrid: HybridSearchEngine,
    keyword_index: Option<Arc<dyn KeywordIndex>>,
    metrics: Option<Arc<MetricsStore>>,
    in_flight: InFlightRegistry,
}

impl KnowledgeBaseService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<VectorStoreClient>,
        indexing: &IndexingConfig,
        search: SearchConfig,
    ) -> Result<Self, KnowledgeBaseError> {
        let chunker = TextChunker::new(ChunkingOptions::from(indexing))?;
        Ok(Self {
            embedder,
            store,
            chunker,
            embed_concurrency: indexing.embed_concurrency.max(1),
            hybrid: HybridSearchEngine::new(search.hybrid.clone()),
            search,
            keyword_index: None,
            metrics: None,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Build the configured embedding provider and vector store.
    pub fn from_config(config: &Config) -> Result<Self, KnowledgeBaseError> {
        let embedder = create_provider(&config.embedding)?;
        let store = Arc::new(VectorStoreClient::from_config(config)?);
        Self::new(embedder, store, &config.indexing, config.search.clone())
    }

    /// Attach a keyword index; enables [`hybrid_search`](Self::hybrid_search).
    pub fn with_keyword_index(mut self, index: Arc<dyn KeywordIndex>) -> Self {
        self.keyword_index = Some(index);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &VectorStoreClient {
        &self.store
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn chunking_options(&self) -> &ChunkingOptions {
        self.chunker.options()
    }

    /// Search options seeded from the configured defaults.
    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions::new()
            .with_limit(self.search.default_limit)
            .with_threshold(self.search.similarity_threshold)
    }

    fn record_metric(&self, operation: Operation, started: Instant, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record(operation, started.elapsed().as_millis() as u64, success);
        }
    }

    fn new_document(
        &self,
        owner_id: &str,
        upload: DocumentUpload,
        text: &str,
    ) -> Result<DocumentMetadata, KnowledgeBaseError> {
        let document_id = match upload.document_id {
            Some(id) if id.trim().is_empty() => {
                return Err(KnowledgeBaseError::Validation(
                    "document id must not be empty".to_string(),
                ));
            }
            Some(id) => id,
            None => DocumentMetadata::generate_id(),
        };
        let options = self.chunker.options();
        Ok(DocumentMetadata {
            document_id,
            file_name: upload.file_name,
            file_path: upload.file_path,
            file_type: upload.file_type,
            file_size: upload.file_size,
            uploaded_at: Utc::now(),
            uploaded_by: owner_id.to_string(),
            title: upload.title,
            author: upload.author,
            created_date: upload.created_date,
            modified_date: upload.modified_date,
            summary: upload.summary,
            language: upload.language,
            content_hash: Some(calculate_checksum(text)),
            chunk_count: 0,
            processing_status: ProcessingStatus::Pending,
            processing_time_ms: None,
            last_error: None,
            embedding_model: self.embedder.model_id().to_string(),
            chunk_size: options.chunk_size as u32,
            overlap_size: options.overlap_size as u32,
        })
    }

    /// Ingest one document.
    ///
    /// Chunk embedding failures, store failures and cancellation do not return
    /// `Err`; they yield a `failed` result with no records left behind. Only
    /// invalid identifiers, and a document id that is already in flight, are
    /// rejected up front.
    pub async fn process_document(
        &self,
        owner_id: &str,
        kb_name: &str,
        upload: DocumentUpload,
        text: &str,
    ) -> Result<DocumentUploadResult, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        let started = Instant::now();

        let mut metadata = self.new_document(owner_id, upload, text)?;
        let flight = InFlight::register(&self.in_flight, &metadata.document_id)?;
        metadata.mark_processing();

        let span = tracing::info_span!(
            "process_document",
            document.id = %metadata.document_id,
            collection = %name,
        );
        let outcome = self
            .ingest(&name, &metadata, text, &flight, started)
            .instrument(span)
            .await;
        drop(flight);

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(chunks) => {
                metadata.mark_completed(chunks, elapsed);
                tracing::info!(
                    document.id = %metadata.document_id,
                    collection = %name,
                    chunks,
                    elapsed_ms = elapsed,
                    "document processed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    document.id = %metadata.document_id,
                    collection = %name,
                    error = %e,
                    "document processing failed"
                );
                metadata.mark_failed(e.to_string(), elapsed);
            }
        }
        self.record_metric(
            Operation::Ingest,
            started,
            metadata.processing_status == ProcessingStatus::Completed,
        );

        Ok(DocumentUploadResult::from_metadata(metadata))
    }

    async fn ingest(
        &self,
        collection_name: &str,
        metadata: &DocumentMetadata,
        text: &str,
        flight: &InFlight<'_>,
        started: Instant,
    ) -> Result<u32, KnowledgeBaseError> {
        let chunks = self.chunker.chunk(text);
        tracing::debug!(chunks = chunks.len(), "document chunked");
        if chunks.is_empty() {
            return Ok(0);
        }
        let chunk_count = chunks.len() as u32;

        // Ordered, bounded fan-out; the first failure stops the stream.
        let embeddings: Vec<Vec<f32>> = stream::iter(0..chunks.len())
            .map(|i| {
                let chunk = &chunks[i];
                async move {
                    flight.check()?;
                    tokio::select! {
                        biased;
                        e = flight.cancelled() => Err(e),
                        embedded = self.embedder.embed(&chunk.content) => {
                            embedded.map_err(KnowledgeBaseError::from)
                        }
                    }
                }
            })
            .buffered(self.embed_concurrency)
            .try_collect()
            .await?;
        flight.check()?;

        // The batch add is the commit point, so stored chunks are already completed.
        let mut stored = metadata.clone();
        stored.mark_completed(chunk_count, started.elapsed().as_millis() as u64);

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                VectorRecord::new(
                    ChunkMetadata::from_chunk(&stored, &chunk),
                    chunk.content,
                    embedding,
                )
            })
            .collect();

        let collection = self.store.get_or_create_collection(collection_name).await?;
        self.store.add_records(&collection, &records).await?;

        if let Err(e) = flight.check() {
            self.remove_document_records(&collection, &metadata.document_id)
                .await?;
            return Err(e);
        }

        if let Some(index) = &self.keyword_index
            && let Err(e) = index.index(collection_name, &records).await
        {
            tracing::warn!(error = %e, "keyword indexing failed");
        }

        Ok(chunk_count)
    }

    /// Ingest several documents one after another. A failed document never
    /// aborts its siblings.
    pub async fn process_documents(
        &self,
        owner_id: &str,
        kb_name: &str,
        documents: Vec<(DocumentUpload, String)>,
    ) -> Result<Vec<DocumentUploadResult>, KnowledgeBaseError> {
        validated_collection_name(owner_id, kb_name)?;
        let mut results = Vec::with_capacity(documents.len());
        for (upload, text) in documents {
            results.push(
                self.process_document(owner_id, kb_name, upload, &text)
                    .await?,
            );
        }
        Ok(results)
    }

    /// Request cancellation of an in-flight document. Returns false if the
    /// document is not currently being processed.
    pub fn cancel_processing(&self, document_id: &str) -> bool {
        let Ok(map) = self.in_flight.lock() else {
            return false;
        };
        match map.get(document_id) {
            Some(signal) => {
                signal.send_replace(true);
                tracing::info!(document.id = %document_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of documents currently being processed.
    pub fn processing_documents(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn vector_search(
        &self,
        collection_name: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, KnowledgeBaseError> {
        let embedding = self.embedder.embed_query(query).await?;
        let collection = self.store.get_or_create_collection(collection_name).await?;
        let filter = completed_only(&options.filters);

        let matches = self
            .store
            .query(&collection, &embedding, options.limit, Some(&filter))
            .await?;

        let mut results: Vec<SearchResult> = matches
            .into_iter()
            .filter_map(SearchResult::from_match)
            .filter(|r| r.score >= options.similarity_threshold)
            .collect();
        rank_results(&mut results);
        results.truncate(options.limit);
        Ok(results)
    }

    /// Rank stored chunks by similarity to `query`.
    ///
    /// Embedding and store failures degrade to an empty result set.
    pub async fn search(
        &self,
        owner_id: &str,
        kb_name: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        if query.trim().is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let (results, success) = match self.vector_search(&name, query, options).await {
            Ok(results) => (results, true),
            Err(e) => {
                tracing::error!(collection = %name, error = %e, "search failed, returning no results");
                (Vec::new(), false)
            }
        };
        tracing::debug!(collection = %name, results = results.len(), "search complete");
        self.record_metric(Operation::Search, started, success);
        Ok(results)
    }

    /// Vector and keyword search run concurrently, merged under the hybrid
    /// score. Without a keyword index this is [`search`](Self::search).
    pub async fn hybrid_search(
        &self,
        owner_id: &str,
        kb_name: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, KnowledgeBaseError> {
        let Some(index) = &self.keyword_index else {
            return self.search(owner_id, kb_name, query, options).await;
        };
        let name = validated_collection_name(owner_id, kb_name)?;
        if query.trim().is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let filter = completed_only(&options.filters);

        let (vector, keyword) = tokio::join!(
            self.vector_search(&name, query, options),
            index.search(&name, query, options.limit, Some(&filter)),
        );

        let mut success = true;
        let vector = vector.unwrap_or_else(|e| {
            tracing::error!(collection = %name, error = %e, "vector search failed");
            success = false;
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|e| {
            tracing::warn!(collection = %name, error = %e, "keyword search failed");
            Vec::new()
        });

        let results = self
            .hybrid
            .merge(vector, keyword, options.limit, Utc::now());
        self.record_metric(Operation::Search, started, success);
        Ok(results)
    }

    pub async fn get_stats(
        &self,
        owner_id: &str,
        kb_name: &str,
    ) -> Result<KnowledgeBaseStats, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        let collection = self.store.get_or_create_collection(&name).await?;
        let stats = self.store.stats(&collection).await?;
        Ok(KnowledgeBaseStats {
            document_count: stats.document_count,
            chunk_count: stats.count,
            total_size_bytes: stats.total_size_bytes,
        })
    }

    async fn remove_document_records(
        &self,
        collection: &Collection,
        document_id: &str,
    ) -> Result<(), KnowledgeBaseError> {
        let filter = MetadataFilter::new().eq("document_id", document_id);
        self.store
            .delete_records(collection, &DeleteSelector::Filter(filter))
            .await?;
        Ok(())
    }

    /// Remove every chunk of a document. Returns false if none were stored.
    pub async fn delete_document(
        &self,
        owner_id: &str,
        kb_name: &str,
        document_id: &str,
    ) -> Result<bool, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        let started = Instant::now();
        let result = self.delete_document_inner(&name, document_id).await;
        self.record_metric(Operation::Delete, started, result.is_ok());
        result
    }

    async fn delete_document_inner(
        &self,
        collection_name: &str,
        document_id: &str,
    ) -> Result<bool, KnowledgeBaseError> {
        let collection = self.store.get_or_create_collection(collection_name).await?;
        let filter = MetadataFilter::new().eq("document_id", document_id);
        let existing = self
            .store
            .get_records(&collection, Some(&filter), 1, None)
            .await?;
        if existing.records.is_empty() {
            return Ok(false);
        }

        self.remove_document_records(&collection, document_id)
            .await?;
        if let Some(index) = &self.keyword_index {
            index.remove_document(collection_name, document_id).await?;
        }
        tracing::info!(collection = %collection_name, document.id = %document_id, "document deleted");
        Ok(true)
    }

    /// Drop the whole knowledge base. Returns false if it did not exist.
    pub async fn clear_knowledge_base(
        &self,
        owner_id: &str,
        kb_name: &str,
    ) -> Result<bool, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        let started = Instant::now();

        let result = self.store.delete_collection(&name).await;
        self.record_metric(Operation::Clear, started, result.is_ok());
        let existed = result?;

        self.embedder.clear_cache();
        if let Some(index) = &self.keyword_index {
            index.clear(&name).await?;
        }
        tracing::info!(collection = %name, existed, "knowledge base cleared");
        Ok(existed)
    }

    /// Repopulate the keyword index from the completed chunks in the store.
    /// Returns the number of chunks indexed.
    pub async fn rebuild_keyword_index(
        &self,
        owner_id: &str,
        kb_name: &str,
    ) -> Result<usize, KnowledgeBaseError> {
        let name = validated_collection_name(owner_id, kb_name)?;
        let Some(index) = &self.keyword_index else {
            return Ok(0);
        };
        let collection = self.store.get_or_create_collection(&name).await?;
        let filter = completed_only(&MetadataFilter::new());

        index.clear(&name).await?;
        let mut indexed = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .get_records(
                    &collection,
                    Some(&filter),
                    SCAN_PAGE_SIZE,
                    cursor.as_deref(),
                )
                .await?;
            let records: Vec<VectorRecord> = page
                .records
                .into_iter()
                .filter_map(|stored| {
                    let metadata = ChunkMetadata::from_map(&stored.metadata)?;
                    Some(VectorRecord {
                        id: stored.id,
                        content: stored.content,
                        metadata,
                        embedding: Vec::new(),
                    })
                })
                .collect();
            index.index(&name, &records).await?;
            indexed += records.len();

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!(collection = %name, indexed, "keyword index rebuilt");
        Ok(indexed)
    }
}
