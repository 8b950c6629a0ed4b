//! In-memory vector store.
//!
//! Collections live in a `tokio::sync::RwLock`-guarded map and vanish with the
//! process. Suitable for tests, demos and small offline knowledge bases.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::VectorStore;
use crate::error::VectorStoreError;
use crate::models::{
    Collection, DeleteSelector, DistanceMetric, MetadataFilter, QueryMatch, RecordPage,
    StoredRecord, VectorDriver, VectorRecord,
};

#[derive(Debug, Clone)]
struct Entry {
    content: String,
    metadata: Map<String, Value>,
    embedding: Vec<f32>,
}

#[derive(Debug)]
struct MemoryCollection {
    id: String,
    metric: DistanceMetric,
    // Fixed by the first add.
    dimension: Option<usize>,
    // Ordered by id so paging is stable.
    records: BTreeMap<String, Entry>,
}

#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all collections, sorted.
    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn not_found(name: &str) -> VectorStoreError {
    VectorStoreError::CollectionNotFound(name.to_string())
}

fn dimension_mismatch(what: &str, got: usize, expected: usize) -> VectorStoreError {
    VectorStoreError::InvalidRequest(format!(
        "{} has dimension {}, collection expects {}",
        what, got, expected
    ))
}

/// Distance under `metric`; lower is closer.
fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        DistanceMetric::Cosine => {
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                return 1.0;
            }
            1.0 - dot / (norm_a * norm_b)
        }
        DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        DistanceMetric::Ip => 1.0 - dot,
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn heartbeat(&self) -> Result<(), VectorStoreError> {
        Ok(())
    }

    async fn get_or_create_collection(
        &self,
        name: &str,
        metric: DistanceMetric,
    ) -> Result<Collection, VectorStoreError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .entry(name.to_string())
            .or_insert_with(|| MemoryCollection {
                id: uuid::Uuid::new_v4().to_string(),
                metric,
                dimension: None,
                records: BTreeMap::new(),
            });

        Ok(Collection {
            name: name.to_string(),
            id: Some(entry.id.clone()),
            metric: entry.metric,
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
        Ok(self.collections.write().await.remove(name).is_some())
    }

    async fn add(
        &self,
        collection: &Collection,
        records: &[VectorRecord],
    ) -> Result<(), VectorStoreError> {
        let mut collections = self.collections.write().await;
        let store = collections
            .get_mut(&collection.name)
            .ok_or_else(|| not_found(&collection.name))?;

        let dimension = store
            .dimension
            .or_else(|| records.first().map(|r| r.embedding.len()));
        if let Some(expected) = dimension
            && let Some(bad) = records.iter().find(|r| r.embedding.len() != expected)
        {
            return Err(dimension_mismatch(
                &format!("embedding for {}", bad.id),
                bad.embedding.len(),
                expected,
            ));
        }
        store.dimension = dimension;

        for record in records {
            store.records.insert(
                record.id.clone(),
                Entry {
                    content: record.content.clone(),
                    metadata: record.metadata.to_map(),
                    embedding: record.embedding.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &Collection,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>, VectorStoreError> {
        let collections = self.collections.read().await;
        let store = collections
            .get(&collection.name)
            .ok_or_else(|| not_found(&collection.name))?;
        if let Some(expected) = store.dimension
            && embedding.len() != expected
        {
            return Err(dimension_mismatch(
                "query embedding",
                embedding.len(),
                expected,
            ));
        }

        let mut matches: Vec<QueryMatch> = store
            .records
            .iter()
            .filter(|(_, e)| filter.is_none_or(|f| f.matches(&e.metadata)))
            .map(|(id, e)| QueryMatch {
                id: id.clone(),
                content: e.content.clone(),
                metadata: e.metadata.clone(),
                distance: distance(store.metric, &e.embedding, embedding),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(n_results);
        Ok(matches)
    }

    async fn get(
        &self,
        collection: &Collection,
        filter: Option<&MetadataFilter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError> {
        let collections = self.collections.read().await;
        let store = collections
            .get(&collection.name)
            .ok_or_else(|| not_found(&collection.name))?;

        // The cursor is the id of the first record of the page.
        let mut records: Vec<StoredRecord> = store
            .records
            .range::<str, _>((
                std::ops::Bound::Included(cursor.unwrap_or_default()),
                std::ops::Bound::Unbounded,
            ))
            .filter(|(_, e)| filter.is_none_or(|f| f.matches(&e.metadata)))
            .take(limit.saturating_add(1))
            .map(|(id, e)| StoredRecord {
                id: id.clone(),
                content: e.content.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();

        let next_cursor = if records.len() > limit {
            records.pop().map(|r| r.id)
        } else {
            None
        };
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }

    async fn delete(
        &self,
        collection: &Collection,
        selector: &DeleteSelector,
    ) -> Result<(), VectorStoreError> {
        let mut collections = self.collections.write().await;
        let store = collections
            .get_mut(&collection.name)
            .ok_or_else(|| not_found(&collection.name))?;

        match selector {
            DeleteSelector::Ids(ids) => {
                for id in ids {
                    store.records.remove(id);
                }
            }
            DeleteSelector::Filter(filter) => {
                store.records.retain(|_, e| !filter.matches(&e.metadata));
            }
        }
        Ok(())
    }

    async fn count(&self, collection: &Collection) -> Result<u64, VectorStoreError> {
        let collections = self.collections.read().await;
        let store = collections
            .get(&collection.name)
            .ok_or_else(|| not_found(&collection.name))?;
        Ok(store.records.len() as u64)
    }

    fn driver(&self) -> VectorDriver {
        VectorDriver::Memory
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, DocumentMetadata, ProcessingStatus, TextChunk};
    use chrono::Utc;

    pub(crate) fn record(doc: &str, index: u32, embedding: Vec<f32>) -> VectorRecord {
        let document = DocumentMetadata {
            document_id: doc.to_string(),
            file_name: format!("{doc}.txt"),
            file_path: None,
            file_type: "text/plain".to_string(),
            file_size: 100,
            uploaded_at: Utc::now(),
            uploaded_by: "u1".to_string(),
            title: None,
            author: None,
            created_date: None,
            modified_date: None,
            summary: None,
            language: None,
            content_hash: None,
            chunk_count: 1,
            processing_status: ProcessingStatus::Completed,
            processing_time_ms: None,
            last_error: None,
            embedding_model: "test".to_string(),
            chunk_size: 512,
            overlap_size: 50,
        };
        let chunk = TextChunk {
            chunk_index: index,
            content: format!("chunk {index} of {doc}"),
            start_position: 0,
            end_position: 10,
            token_count: 3,
            sentences: vec![],
        };
        let metadata = ChunkMetadata::from_chunk(&document, &chunk);
        VectorRecord::new(metadata, chunk.content, embedding)
    }

    #[tokio::test]
    async fn test_own_embedding_is_top_match() {
        let store = InMemoryVectorStore::new();
        let col = store
            .get_or_create_collection("kb_t", DistanceMetric::Cosine)
            .await
            .unwrap();
        let records = vec![
            record("d1", 0, vec![1.0, 0.0, 0.0]),
            record("d1", 1, vec![0.0, 1.0, 0.0]),
            record("d2", 0, vec![0.7, 0.7, 0.0]),
        ];
        store.add(&col, &records).await.unwrap();

        let matches = store.query(&col, &[0.0, 1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "d1_chunk_1");
        assert!(matches[0].distance.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_filter_and_delete() {
        let store = InMemoryVectorStore::new();
        let col = store
            .get_or_create_collection("kb_t", DistanceMetric::Cosine)
            .await
            .unwrap();
        store
            .add(
                &col,
                &[
                    record("d1", 0, vec![1.0, 0.0]),
                    record("d2", 0, vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let only_d2 = MetadataFilter::new().eq("document_id", "d2");
        let hits = store
            .query(&col, &[1.0, 0.0], 10, Some(&only_d2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "d2_chunk_0");

        store
            .delete(&col, &DeleteSelector::Filter(only_d2))
            .await
            .unwrap();
        assert_eq!(store.count(&col).await.unwrap(), 1);

        store
            .delete(&col, &DeleteSelector::Ids(vec!["d1_chunk_0".into()]))
            .await
            .unwrap();
        assert_eq!(store.count(&col).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = InMemoryVectorStore::new();
        let a = store
            .get_or_create_collection("kb_x", DistanceMetric::Cosine)
            .await
            .unwrap();
        let b = store
            .get_or_create_collection("kb_x", DistanceMetric::Cosine)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.collection_names().await, vec!["kb_x"]);

        assert!(store.delete_collection("kb_x").await.unwrap());
        assert!(!store.delete_collection("kb_x").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_collection_errors() {
        let store = InMemoryVectorStore::new();
        let col = Collection::new("kb_missing", DistanceMetric::Cosine);
        assert!(matches!(
            store.count(&col).await,
            Err(VectorStoreError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_pages_in_id_order() {
        let store = InMemoryVectorStore::new();
        let col = store
            .get_or_create_collection("kb_p", DistanceMetric::Cosine)
            .await
            .unwrap();
        let records: Vec<_> = (0..5).map(|i| record("d", i, vec![1.0])).collect();
        store.add(&col, &records).await.unwrap();

        let first = store.get(&col, None, 2, None).await.unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d_chunk_0", "d_chunk_1"]);
        assert_eq!(first.next_cursor.as_deref(), Some("d_chunk_2"));

        let second = store
            .get(&col, None, 2, first.next_cursor.as_deref())
            .await
            .unwrap();
        let ids: Vec<_> = second.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d_chunk_2", "d_chunk_3"]);

        let last = store
            .get(&col, None, 2, second.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(last.records.len(), 1);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = InMemoryVectorStore::new();
        let col = store
            .get_or_create_collection("kb_dim", DistanceMetric::Cosine)
            .await
            .unwrap();
        store
            .add(&col, &[record("d1", 0, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let add = store.add(&col, &[record("d2", 0, vec![1.0, 0.0])]).await;
        assert!(matches!(add, Err(VectorStoreError::InvalidRequest(_))));
        assert_eq!(store.count(&col).await.unwrap(), 1);

        let mixed = store
            .add(
                &col,
                &[
                    record("d3", 0, vec![1.0, 0.0, 0.0]),
                    record("d3", 1, vec![1.0]),
                ],
            )
            .await;
        assert!(matches!(mixed, Err(VectorStoreError::InvalidRequest(_))));
        assert_eq!(store.count(&col).await.unwrap(), 1);

        let query = store.query(&col, &[1.0, 0.0], 5, None).await;
        assert!(matches!(query, Err(VectorStoreError::InvalidRequest(_))));
    }
}
