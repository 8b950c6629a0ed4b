use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version tag stored with every chunk so re-embedding migrations can find stale records.
pub const EMBEDDING_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a document moving through the ingestion pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Completed and failed documents only change through re-processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            _ => Err(format!("unknown processing status: {}", s)),
        }
    }
}

/// An uploaded source document as it moves through the pipeline.
///
/// Serialized flat (optional fields omitted) so it can be stored as record
/// metadata in stores that only accept scalar values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub file_type: String,
    pub file_size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub chunk_count: u32,
    #[serde(default)]
    pub processing_status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub embedding_model: String,
    pub chunk_size: u32,
    pub overlap_size: u32,
}

impl DocumentMetadata {
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Age of the document in fractional days relative to `now` (never negative).
    pub fn age_in_days(&self, now: DateTime<Utc>) -> f64 {
        let seconds = (now - self.uploaded_at).num_seconds().max(0);
        seconds as f64 / 86_400.0
    }

    pub(crate) fn mark_processing(&mut self) {
        self.processing_status = ProcessingStatus::Processing;
        self.last_error = None;
    }

    pub(crate) fn mark_completed(&mut self, chunk_count: u32, elapsed_ms: u64) {
        self.processing_status = ProcessingStatus::Completed;
        self.chunk_count = chunk_count;
        self.processing_time_ms = Some(elapsed_ms);
        self.last_error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>, elapsed_ms: u64) {
        self.processing_status = ProcessingStatus::Failed;
        self.chunk_count = 0;
        self.processing_time_ms = Some(elapsed_ms);
        self.last_error = Some(error.into());
    }
}

/// Per-chunk metadata: the owning document's metadata plus chunk position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(flatten)]
    pub document: DocumentMetadata,
    pub chunk_index: u32,
    pub start_position: usize,
    pub end_position: usize,
    pub token_count: usize,
    pub embedding_version: u32,
}

impl ChunkMetadata {
    pub fn from_chunk(document: &DocumentMetadata, chunk: &TextChunk) -> Self {
        Self {
            document: document.clone(),
            chunk_index: chunk.chunk_index,
            start_position: chunk.start_position,
            end_position: chunk.end_position,
            token_count: chunk.token_count,
            embedding_version: EMBEDDING_SCHEMA_VERSION,
        }
    }

    /// Flatten into a JSON object suitable for a record's metadata.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild from a stored metadata object.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        serde_json::from_value(serde_json::Value::Object(map.clone())).ok()
    }
}

/// A span of the source text produced by the chunker.
///
/// Offsets are character offsets into the source; `content` is the exact source span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub chunk_index: u32,
    pub content: String,
    pub start_position: usize,
    pub end_position: usize,
    pub token_count: usize,
    pub sentences: Vec<String>,
}

/// The unit persisted in the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    pub fn generate_id(document_id: &str, chunk_index: u32) -> String {
        format!("{}_chunk_{}", document_id, chunk_index)
    }

    pub fn new(metadata: ChunkMetadata, content: String, embedding: Vec<f32>) -> Self {
        Self {
            id: Self::generate_id(&metadata.document.document_id, metadata.chunk_index),
            content,
            metadata,
            embedding,
        }
    }
}

/// Caller-supplied description of an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpload {
    /// Id to store the document under; generated when absent. Known before
    /// ingestion starts, so it can be passed to `cancel_processing`.
    pub document_id: Option<String>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub file_path: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_date: Option<String>,
    pub modified_date: Option<String>,
    pub summary: Option<String>,
    pub language: Option<String>,
}

impl DocumentUpload {
    pub fn new(file_name: impl Into<String>, file_type: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            ..Default::default()
        }
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Outcome of `process_document`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUploadResult {
    pub document_id: String,
    pub chunks_processed: u32,
    pub processing_time_ms: u64,
    pub status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: DocumentMetadata,
}

impl DocumentUploadResult {
    pub fn from_metadata(metadata: DocumentMetadata) -> Self {
        Self {
            document_id: metadata.document_id.clone(),
            chunks_processed: metadata.chunk_count,
            processing_time_ms: metadata.processing_time_ms.unwrap_or(0),
            status: metadata.processing_status,
            error: metadata.last_error.clone(),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}
