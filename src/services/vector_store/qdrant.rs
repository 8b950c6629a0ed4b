//! Qdrant vector store backend implementation.
//!
//! Record ids are arbitrary strings, but Qdrant point ids must be integers or
//! UUIDs, so each record id is mapped to a name-based UUID and the original is
//! kept in the payload under `record_id`.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    ListValue, PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    Struct, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use super::VectorStore;
use crate::error::VectorStoreError;
use crate::models::{
    Collection, DeleteSelector, DistanceMetric, MetadataFilter, QueryMatch, RecordPage,
    StoredRecord, VectorDriver, VectorRecord, VectorStoreConfig,
};

const RECORD_ID_KEY: &str = "record_id";
const CONTENT_KEY: &str = "content";

/// Qdrant vector store backend.
pub struct QdrantBackend {
    client: Qdrant,
    dimension: u64,
}

impl QdrantBackend {
    pub fn new(config: &VectorStoreConfig, dimension: u64) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url)
            .timeout(std::time::Duration::from_secs(config.timeout_secs));

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        Ok(Self { client, dimension })
    }

    fn build_filter(filter: &MetadataFilter) -> Result<Option<Filter>, VectorStoreError> {
        let mut must = Vec::new();
        for (key, value) in filter.iter() {
            let condition = match value {
                Value::String(s) => Condition::matches(key.as_str(), s.clone()),
                Value::Bool(b) => Condition::matches(key.as_str(), *b),
                Value::Number(n) if n.is_i64() => {
                    Condition::matches(key.as_str(), n.as_i64().unwrap_or_default())
                }
                other => {
                    return Err(VectorStoreError::InvalidRequest(format!(
                        "unsupported filter value for {}: {}",
                        key, other
                    )));
                }
            };
            must.push(condition);
        }

        Ok((!must.is_empty()).then(|| Filter::must(must)))
    }

    /// One scroll request; Qdrant's `next_page_offset` becomes the cursor.
    async fn scroll_page(
        &self,
        collection: &str,
        filter: Option<Filter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError> {
        if limit == 0 {
            return Ok(RecordPage::default());
        }

        let mut scroll = ScrollPointsBuilder::new(collection)
            .limit(u32::try_from(limit).unwrap_or(u32::MAX))
            .with_payload(true)
            .with_vectors(false);
        if let Some(f) = filter {
            scroll = scroll.filter(f);
        }
        if let Some(c) = cursor {
            scroll = scroll.offset(cursor_to_point(c));
        }

        let response = self.client.scroll(scroll).await.map_err(map_error)?;
        let records = response
            .result
            .into_iter()
            .map(|point| {
                let mut metadata = payload_to_map(point.payload);
                let id = take_record_id(&mut metadata, point.id.as_ref());
                let content = match metadata.remove(CONTENT_KEY) {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                StoredRecord {
                    id,
                    content,
                    metadata,
                }
            })
            .collect();

        Ok(RecordPage {
            records,
            next_cursor: response.next_page_offset.as_ref().and_then(point_to_cursor),
        })
    }
}

/// Deterministic point id for a record id.
pub(crate) fn point_id(record_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes()).to_string()
}

fn qdrant_distance(metric: DistanceMetric) -> Distance {
    match metric {
        DistanceMetric::Cosine => Distance::Cosine,
        DistanceMetric::L2 => Distance::Euclid,
        DistanceMetric::Ip => Distance::Dot,
    }
}

/// Qdrant reports similarity for cosine and dot, distance for euclid.
fn score_to_distance(metric: DistanceMetric, score: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Ip => 1.0 - score,
        DistanceMetric::L2 => score,
    }
}

fn map_error(e: qdrant_client::QdrantError) -> VectorStoreError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("not found") || lower.contains("doesn't exist") {
        VectorStoreError::CollectionNotFound(msg)
    } else if lower.contains("timeout") || lower.contains("deadline") {
        VectorStoreError::Timeout
    } else {
        VectorStoreError::ClientError(msg)
    }
}

fn json_to_qdrant(value: Value) -> QdrantValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_qdrant).collect(),
        }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn qdrant_to_json(value: QdrantValue) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_map(payload: HashMap<String, QdrantValue>) -> Map<String, Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_to_json(v)))
        .collect()
}

/// Pull the original record id out of the payload, falling back to the point id.
fn take_record_id(metadata: &mut Map<String, Value>, point: Option<&PointId>) -> String {
    if let Some(Value::String(id)) = metadata.remove(RECORD_ID_KEY) {
        return id;
    }
    point.and_then(point_to_cursor).unwrap_or_default()
}

fn point_to_cursor(point: &PointId) -> Option<String> {
    match point.point_id_options.as_ref()? {
        PointIdOptions::Uuid(uuid) => Some(uuid.clone()),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

fn cursor_to_point(cursor: &str) -> PointId {
    match cursor.parse::<u64>() {
        Ok(num) => PointId::from(num),
        Err(_) => PointId::from(cursor.to_string()),
    }
}

#[async_trait]
impl VectorStore for QdrantBackend {
    async fn heartbeat(&self) -> Result<(), VectorStoreError> {
        self.client
            .health_check()
            .await
            .map(|_| ())
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn get_or_create_collection(
        &self,
        name: &str,
        metric: DistanceMetric,
    ) -> Result<Collection, VectorStoreError> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(map_error)?;
        if !exists {
            let create = CreateCollectionBuilder::new(name).vectors_config(
                VectorParamsBuilder::new(self.dimension, qdrant_distance(metric)),
            );
            if let Err(e) = self.client.create_collection(create).await {
                // Lost a creation race with another caller.
                if !self
                    .client
                    .collection_exists(name)
                    .await
                    .map_err(map_error)?
                {
                    return Err(map_error(e));
                }
            }
        }

        Ok(Collection::new(name, metric))
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
        if !self
            .client
            .collection_exists(name)
            .await
            .map_err(map_error)?
        {
            return Ok(false);
        }
        self.client
            .delete_collection(name)
            .await
            .map_err(map_error)?;
        Ok(true)
    }

    async fn add(
        &self,
        collection: &Collection,
        records: &[VectorRecord],
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = records
            .iter()
            .map(|record| {
                let mut payload: HashMap<String, QdrantValue> = record
                    .metadata
                    .to_map()
                    .into_iter()
                    .map(|(k, v)| (k, json_to_qdrant(v)))
                    .collect();
                payload.insert(RECORD_ID_KEY.to_string(), record.id.clone().into());
                payload.insert(CONTENT_KEY.to_string(), record.content.clone().into());

                PointStruct::new(point_id(&record.id), record.embedding.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&collection.name, points).wait(true))
            .await
            .map_err(map_error)?;

        Ok(())
    }

    async fn query(
        &self,
        collection: &Collection,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>, VectorStoreError> {
        let mut search =
            SearchPointsBuilder::new(&collection.name, embedding.to_vec(), n_results as u64)
                .with_payload(true);

        if let Some(f) = filter.map(Self::build_filter).transpose()?.flatten() {
            search = search.filter(f);
        }

        let response = self.client.search_points(search).await.map_err(map_error)?;

        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let mut metadata = payload_to_map(point.payload);
                let id = take_record_id(&mut metadata, point.id.as_ref());
                let content = match metadata.remove(CONTENT_KEY) {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                QueryMatch {
                    id,
                    content,
                    metadata,
                    distance: score_to_distance(collection.metric, point.score),
                }
            })
            .collect())
    }

    async fn get(
        &self,
        collection: &Collection,
        filter: Option<&MetadataFilter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError> {
        let filter = filter.map(Self::build_filter).transpose()?.flatten();
        self.scroll_page(&collection.name, filter, limit, cursor)
            .await
    }

    async fn delete(
        &self,
        collection: &Collection,
        selector: &DeleteSelector,
    ) -> Result<(), VectorStoreError> {
        let delete = match selector {
            DeleteSelector::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(());
                }
                let ids: Vec<PointId> = ids.iter().map(|id| point_id(id).into()).collect();
                DeletePointsBuilder::new(&collection.name).points(PointsIdsList { ids })
            }
            DeleteSelector::Filter(filter) => {
                let Some(f) = Self::build_filter(filter)? else {
                    return Err(VectorStoreError::InvalidRequest(
                        "refusing to delete with an empty filter".to_string(),
                    ));
                };
                DeletePointsBuilder::new(&collection.name).points(f)
            }
        };

        self.client
            .delete_points(delete.wait(true))
            .await
            .map_err(map_error)?;

        Ok(())
    }

    async fn count(&self, collection: &Collection) -> Result<u64, VectorStoreError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&collection.name).exact(true))
            .await
            .map_err(map_error)?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    fn driver(&self) -> VectorDriver {
        VectorDriver::Qdrant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_id_is_stable_uuid() {
        let a = point_id("doc_chunk_0");
        assert_eq!(a, point_id("doc_chunk_0"));
        assert_ne!(a, point_id("doc_chunk_1"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_payload_conversion_round_trip() {
        let original = json!({
            "document_id": "d1",
            "chunk_index": 3,
            "file_size": 1024,
            "score": 0.5,
            "done": true,
            "nested": {"list": [1, "two"]}
        });
        let Value::Object(map) = original.clone() else {
            unreachable!()
        };
        let payload: HashMap<String, QdrantValue> = map
            .into_iter()
            .map(|(k, v)| (k, json_to_qdrant(v)))
            .collect();

        assert_eq!(Value::Object(payload_to_map(payload)), original);
    }

    #[test]
    fn test_take_record_id_prefers_payload() {
        let mut meta = Map::new();
        meta.insert(RECORD_ID_KEY.into(), json!("d1_chunk_0"));
        meta.insert("document_id".into(), json!("d1"));
        assert_eq!(take_record_id(&mut meta, None), "d1_chunk_0");
        assert!(!meta.contains_key(RECORD_ID_KEY));
    }

    #[test]
    fn test_scan_cursor_maps_back_to_point_id() {
        let uuid = point_id("d1_chunk_7");
        let point = cursor_to_point(&uuid);
        assert_eq!(point, PointId::from(uuid.clone()));
        assert_eq!(point_to_cursor(&point), Some(uuid));

        let numeric = PointId::from(42u64);
        assert_eq!(point_to_cursor(&numeric).as_deref(), Some("42"));
        assert_eq!(cursor_to_point("42"), numeric);
    }

    #[test]
    fn test_build_filter() {
        assert!(
            QdrantBackend::build_filter(&MetadataFilter::new())
                .unwrap()
                .is_none()
        );
        let filter = MetadataFilter::new()
            .eq("processing_status", "completed")
            .eq("chunk_index", 2);
        assert!(QdrantBackend::build_filter(&filter).unwrap().is_some());

        let bad = MetadataFilter::new().eq("x", json!([1, 2]));
        assert!(matches!(
            QdrantBackend::build_filter(&bad),
            Err(VectorStoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_score_to_distance() {
        assert!((score_to_distance(DistanceMetric::Cosine, 0.8) - 0.2).abs() < 1e-6);
        assert_eq!(score_to_distance(DistanceMetric::L2, 3.0), 3.0);
    }
}
