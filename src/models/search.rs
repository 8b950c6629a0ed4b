//! Search-related models for queries and results.

use serde::{Deserialize, Serialize};

use super::collection::{MetadataFilter, QueryMatch};
use super::document::ChunkMetadata;

pub const DEFAULT_SEARCH_LIMIT: usize = 5;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.1;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// Machine-parseable JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Options for a knowledge-base query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum results to return
    pub limit: usize,

    /// Minimum similarity score a result must reach
    pub similarity_threshold: f32,

    /// Extra metadata equality filters
    #[serde(default)]
    pub filters: MetadataFilter,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            filters: MetadataFilter::default(),
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the minimum similarity threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Add metadata filters.
    pub fn with_filters(mut self, filters: MetadataFilter) -> Self {
        self.filters = filters;
        self
    }
}

/// A single ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Record (chunk) id
    pub id: String,

    /// Chunk content
    pub content: String,

    /// Chunk and document metadata
    pub metadata: ChunkMetadata,

    /// Raw distance reported by the store (absent for keyword-only hits)
    pub distance: Option<f32>,

    /// Derived relevance score; higher is closer
    pub score: f32,

    /// Whether the keyword index also matched this result
    #[serde(default)]
    pub keyword_match: bool,
}

impl SearchResult {
    /// Convert a raw match, scoring it as `1 - distance`.
    ///
    /// Returns `None` if the stored metadata cannot be decoded.
    pub fn from_match(raw: QueryMatch) -> Option<Self> {
        let metadata = ChunkMetadata::from_map(&raw.metadata)?;
        let score = raw.similarity();
        Some(Self {
            id: raw.id,
            content: raw.content,
            metadata,
            distance: Some(raw.distance),
            score,
            keyword_match: false,
        })
    }
}

/// Aggregate figures for one knowledge base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    pub document_count: u64,
    pub chunk_count: u64,
    pub total_size_bytes: u64,
}

/// Sort descending by score, ties broken by id for stable output.
pub fn rank_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
