//! Collection handles and the raw record shapes exchanged with a vector store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Distance metric a collection is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    Ip,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::Ip => write!(f, "ip"),
        }
    }
}

/// Handle to a collection in the external store.
///
/// The store owns the collection's lifetime; a handle is only a cached reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub id: Option<String>,
    pub metric: DistanceMetric,
}

impl Collection {
    pub fn new(name: impl Into<String>, metric: DistanceMetric) -> Self {
        Self {
            name: name.into(),
            id: None,
            metric,
        }
    }
}

/// Conjunction of metadata equality predicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter(BTreeMap<String, Value>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality predicate `key == value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Merge another filter's predicates into this one (later values win).
    pub fn merge(mut self, other: &MetadataFilter) -> Self {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True if every predicate matches the given metadata.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.0.iter().all(|(k, v)| metadata.get(k) == Some(v))
    }

    /// Render as a `where` clause: a bare object for one predicate, `$and` otherwise.
    pub fn to_where(&self) -> Option<Value> {
        let clauses: Vec<Value> = self
            .0
            .iter()
            .map(|(k, v)| {
                let mut clause = Map::new();
                clause.insert(k.clone(), v.clone());
                Value::Object(clause)
            })
            .collect();

        match clauses.len() {
            0 => None,
            1 => clauses.into_iter().next(),
            _ => Some(serde_json::json!({ "$and": clauses })),
        }
    }
}

/// What to remove from a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteSelector {
    Ids(Vec<String>),
    Filter(MetadataFilter),
}

/// One nearest-neighbour match as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub distance: f32,
}

impl QueryMatch {
    /// Similarity under cosine distance.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// A stored record without its embedding, as returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// One page of a record scan.
///
/// `next_cursor` resumes the scan where this page ended; `None` once the scan
/// is exhausted. Cursors are backend specific and opaque to callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<StoredRecord>,
    pub next_cursor: Option<String>,
}

/// Aggregate figures for a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Number of stored records (chunks).
    pub count: u64,
    /// Number of distinct documents referenced by the records.
    pub document_count: u64,
    /// Sum of the source documents' byte sizes.
    pub total_size_bytes: u64,
}
