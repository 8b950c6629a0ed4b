//! Keyword index collaborator for hybrid search.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing, TextOptions, Value,
};
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term, doc};

use crate::error::KeywordIndexError;
use crate::models::{ChunkMetadata, MetadataFilter, VectorRecord};

const TOKENIZER: &str = "kb_text";
const WRITER_HEAP_BYTES: usize = 50_000_000;
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it", "its",
    "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with",
];

/// A chunk found by keyword match.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Match strength in `(0, 1]`, relative to the best hit of the query
    pub score: f32,
}

/// Lexical index kept alongside the vector store, partitioned by collection.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Insert or replace chunks by id.
    async fn index(
        &self,
        collection: &str,
        records: &[VectorRecord],
    ) -> Result<(), KeywordIndexError>;

    async fn search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<KeywordHit>, KeywordIndexError>;

    /// Remove every chunk of one document. Returns the number removed.
    async fn remove_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, KeywordIndexError>;

    async fn clear(&self, collection: &str) -> Result<(), KeywordIndexError>;
}

fn index_err(e: tantivy::TantivyError) -> KeywordIndexError {
    KeywordIndexError::Unavailable(e.to_string())
}

#[derive(Clone, Copy)]
struct Fields {
    key: Field,
    id: Field,
    collection: Field,
    document_id: Field,
    content: Field,
    metadata: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let content_indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let fields = Fields {
        key: builder.add_text_field("key", STRING),
        id: builder.add_text_field("id", STRING | STORED),
        collection: builder.add_text_field("collection", STRING | STORED),
        document_id: builder.add_text_field("document_id", STRING | STORED),
        content: builder.add_text_field(
            "content",
            TextOptions::default()
                .set_indexing_options(content_indexing)
                .set_stored(),
        ),
        metadata: builder.add_text_field("metadata", STORED),
    };
    (builder.build(), fields)
}

fn register_tokenizer(index: &Index) {
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(
            STOP_WORDS.iter().map(|w| w.to_string()),
        ))
        .filter(Stemmer::new(Language::English))
        .build();
    index.tokenizers().register(TOKENIZER, analyzer);
}

struct Inner {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
}

impl Inner {
    fn term_query(&self, field: Field, value: &str) -> Box<dyn Query> {
        Box::new(TermQuery::new(
            Term::from_field_text(field, value),
            IndexRecordOption::Basic,
        ))
    }

    fn in_collection(&self, collection: &str) -> Box<dyn Query> {
        // Restricts without contributing to the BM25 score.
        Box::new(ConstScoreQuery::new(
            self.term_query(self.fields.collection, collection),
            0.0,
        ))
    }

    fn document_query(&self, collection: &str, document_id: &str) -> BooleanQuery {
        BooleanQuery::new(vec![
            (
                Occur::Must,
                self.term_query(self.fields.collection, collection),
            ),
            (
                Occur::Must,
                self.term_query(self.fields.document_id, document_id),
            ),
        ])
    }

    fn count(&self, query: &dyn Query) -> Result<usize, KeywordIndexError> {
        self.reader
            .searcher()
            .search(query, &Count)
            .map_err(index_err)
    }

    /// Apply pending operations and make them visible to searches.
    fn commit(&self, writer: &mut IndexWriter) -> Result<(), KeywordIndexError> {
        writer.commit().map_err(index_err)?;
        self.reader.reload().map_err(index_err)
    }

    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<(), KeywordIndexError> {
        let f = self.fields;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for record in records {
            let key = format!("{}/{}", collection, record.id);
            writer.delete_term(Term::from_field_text(f.key, &key));
            let metadata = serde_json::to_string(&record.metadata)
                .map_err(|e| KeywordIndexError::Unavailable(e.to_string()))?;
            writer
                .add_document(doc!(
                    f.key => key,
                    f.id => record.id.clone(),
                    f.collection => collection.to_string(),
                    f.document_id => record.metadata.document.document_id.clone(),
                    f.content => record.content.clone(),
                    f.metadata => metadata,
                ))
                .map_err(index_err)?;
        }
        self.commit(&mut writer)
    }

    fn search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<KeywordHit>, KeywordIndexError> {
        let f = self.fields;
        let parser = QueryParser::for_index(&self.index, vec![f.content]);
        // Lenient: stray quotes or colons in user text must not fail the query.
        let (text_query, _) = parser.parse_query_lenient(query);
        let query = BooleanQuery::new(vec![
            (Occur::Must, text_query),
            (Occur::Must, self.in_collection(collection)),
        ]);

        let searcher = self.reader.searcher();
        let filter = filter.filter(|m| !m.is_empty());
        // Filters are applied to stored metadata, so a filtered search ranks
        // every match before truncating.
        let candidates = match filter {
            Some(_) => searcher.search(&query, &Count).map_err(index_err)?,
            None => limit,
        };
        if candidates == 0 {
            return Ok(Vec::new());
        }

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(candidates))
            .map_err(index_err)?;

        let mut hits = Vec::new();
        for (score, address) in top_docs {
            let stored: TantivyDocument = searcher.doc(address).map_err(index_err)?;
            let text = |field: Field| {
                stored
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let Ok(metadata) = serde_json::from_str::<ChunkMetadata>(&text(f.metadata)) else {
                tracing::debug!(id = %text(f.id), "skipping keyword hit with unreadable metadata");
                continue;
            };
            if let Some(filter) = filter
                && !filter.matches(&metadata.to_map())
            {
                continue;
            }
            hits.push(KeywordHit {
                id: text(f.id),
                content: text(f.content),
                metadata,
                score,
            });
            if hits.len() >= limit {
                break;
            }
        }

        if let Some(best) = hits.first().map(|h| h.score).filter(|s| *s > 0.0) {
            for hit in &mut hits {
                hit.score /= best;
            }
        }
        Ok(hits)
    }

    fn remove_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, KeywordIndexError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let query = self.document_query(collection, document_id);
        let removed = self.count(&query)?;
        if removed > 0 {
            writer.delete_query(Box::new(query)).map_err(index_err)?;
            self.commit(&mut writer)?;
        }
        Ok(removed)
    }

    fn clear(&self, collection: &str) -> Result<(), KeywordIndexError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.delete_term(Term::from_field_text(self.fields.collection, collection));
        self.commit(&mut writer)
    }
}

/// BM25 keyword index held in RAM.
///
/// Content is lower-cased, stop-word filtered and stemmed, so "chunking"
/// matches "chunks". Collections share one index and are separated by a term.
/// The index lives as long as the process; see
/// `KnowledgeBaseService::rebuild_keyword_index` for repopulating it.
#[derive(Clone)]
pub struct TantivyKeywordIndex {
    inner: Arc<Inner>,
}

impl TantivyKeywordIndex {
    pub fn new() -> Result<Self, KeywordIndexError> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        register_tokenizer(&index);

        let writer = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(index_err)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(index_err)?;

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                reader,
                writer: Mutex::new(writer),
                fields,
            }),
        })
    }

    /// Number of chunks indexed for `collection`.
    pub async fn len(&self, collection: &str) -> Result<usize, KeywordIndexError> {
        let collection = collection.to_string();
        self.blocking(move |inner| {
            let query = inner.term_query(inner.fields.collection, &collection);
            inner.count(query.as_ref())
        })
        .await
    }

    /// Index work is CPU bound and takes the writer lock, so it runs off the
    /// async workers.
    async fn blocking<T, F>(&self, work: F) -> Result<T, KeywordIndexError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, KeywordIndexError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || work(&inner))
            .await
            .map_err(|e| KeywordIndexError::Unavailable(format!("index task failed: {}", e)))?
    }
}

#[async_trait]
impl KeywordIndex for TantivyKeywordIndex {
    async fn index(
        &self,
        collection: &str,
        records: &[VectorRecord],
    ) -> Result<(), KeywordIndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let collection = collection.to_string();
        let records = records.to_vec();
        self.blocking(move |inner| inner.upsert(&collection, &records))
            .await
    }

    async fn search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<KeywordHit>, KeywordIndexError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let collection = collection.to_string();
        let query = query.to_string();
        let filter = filter.cloned();
        self.blocking(move |inner| inner.search(&collection, &query, limit, filter.as_ref()))
            .await
    }

    async fn remove_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, KeywordIndexError> {
        let collection = collection.to_string();
        let document_id = document_id.to_string();
        self.blocking(move |inner| inner.remove_document(&collection, &document_id))
            .await
    }

    async fn clear(&self, collection: &str) -> Result<(), KeywordIndexError> {
        let collection = collection.to_string();
        self.blocking(move |inner| inner.clear(&collection)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vector_store::memory::tests::record;

    fn with_content(doc: &str, index: u32, content: &str) -> VectorRecord {
        let mut r = record(doc, index, vec![1.0]);
        r.content = content.to_string();
        r
    }

    fn ids(hits: &[KeywordHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_bm25_ranks_denser_match_first() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index(
                "kb_a",
                &[
                    with_content(
                        "d1",
                        0,
                        "Rust borrow checker explained. Borrow rules in Rust.",
                    ),
                    with_content("d2", 0, "The borrow of a library book"),
                    with_content("d3", 0, "Unrelated gardening notes"),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("kb_a", "rust borrow", 10, None).await.unwrap();
        assert_eq!(ids(&hits), vec!["d1_chunk_0", "d2_chunk_0"]);
        assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
        assert!(hits[1].score < hits[0].score);
    }

    #[tokio::test]
    async fn test_stemming_matches_inflections() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index(
                "kb_a",
                &[with_content("d1", 0, "Documents are split into chunks.")],
            )
            .await
            .unwrap();

        let hits = index.search("kb_a", "chunking", 5, None).await.unwrap();
        assert_eq!(ids(&hits), vec!["d1_chunk_0"]);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index("kb_a", &[with_content("d1", 0, "shared term")])
            .await
            .unwrap();
        assert!(
            index
                .search("kb_b", "shared", 5, None)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            index.search("kb_a", "shared", 5, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reindexing_replaces_by_id() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index("kb_a", &[with_content("d1", 0, "first version")])
            .await
            .unwrap();
        index
            .index("kb_a", &[with_content("d1", 0, "second version")])
            .await
            .unwrap();

        assert_eq!(index.len("kb_a").await.unwrap(), 1);
        assert!(
            index
                .search("kb_a", "first", 5, None)
                .await
                .unwrap()
                .is_empty()
        );
        let hits = index.search("kb_a", "second", 5, None).await.unwrap();
        assert_eq!(hits[0].content, "second version");
    }

    #[tokio::test]
    async fn test_remove_document_and_clear() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index(
                "kb_a",
                &[
                    with_content("d1", 0, "alpha"),
                    with_content("d1", 1, "beta"),
                    with_content("d2", 0, "alpha"),
                ],
            )
            .await
            .unwrap();
        index
            .index("kb_b", &[with_content("d1", 0, "alpha")])
            .await
            .unwrap();

        assert_eq!(index.remove_document("kb_a", "d1").await.unwrap(), 2);
        assert_eq!(index.len("kb_a").await.unwrap(), 1);
        assert_eq!(index.len("kb_b").await.unwrap(), 1);
        assert_eq!(index.remove_document("kb_a", "d1").await.unwrap(), 0);

        index.clear("kb_a").await.unwrap();
        assert_eq!(index.len("kb_a").await.unwrap(), 0);
        assert_eq!(index.len("kb_b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_applies() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index(
                "kb_a",
                &[
                    with_content("d1", 0, "alpha"),
                    with_content("d2", 0, "alpha"),
                ],
            )
            .await
            .unwrap();
        let filter = MetadataFilter::new().eq("document_id", "d2");
        let hits = index
            .search("kb_a", "alpha", 5, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document.document_id, "d2");
    }

    #[tokio::test]
    async fn test_query_syntax_in_user_text_does_not_fail() {
        let index = TantivyKeywordIndex::new().unwrap();
        index
            .index("kb_a", &[with_content("d1", 0, "error codes explained")])
            .await
            .unwrap();
        let result = index
            .search("kb_a", "\"error codes: (unbalanced", 5, None)
            .await;
        assert!(result.is_ok());
    }
}
