//! REST vector database backend.
//!
//! Speaks the collection/record protocol: `PUT /collections/{name}`,
//! `POST .../add|query|get|delete`, `GET .../count`, `DELETE /collections/{name}`
//! and `GET /heartbeat`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::VectorStore;
use crate::error::VectorStoreError;
use crate::models::{
    Collection, DeleteSelector, DistanceMetric, MetadataFilter, QueryMatch, RecordPage,
    StoredRecord, VectorDriver, VectorRecord, VectorStoreConfig,
};

#[derive(Debug, Serialize)]
struct CreateCollectionRequest {
    metric: DistanceMetric,
    get_or_create: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CollectionResponse {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    ids: Vec<&'a str>,
    documents: Vec<&'a str>,
    embeddings: Vec<&'a [f32]>,
    metadatas: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query_embeddings: Vec<&'a [f32]>,
    n_results: usize,
    include: [&'static str; 3],
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    where_clause: Option<Value>,
}

/// Arrays are indexed per query embedding, then per match.
#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<Map<String, Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GetRequest {
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    where_clause: Option<Value>,
    limit: usize,
    offset: usize,
    include: [&'static str; 2],
}

#[derive(Debug, Default, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Vec<Option<String>>,
    #[serde(default)]
    metadatas: Vec<Option<Map<String, Value>>>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    where_clause: Option<Value>,
}

/// `count` is returned either bare or wrapped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CountResponse {
    Bare(u64),
    Wrapped { count: u64 },
}

impl QueryResponse {
    fn into_matches(self) -> Result<Vec<QueryMatch>, VectorStoreError> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let distances = self.distances.into_iter().next().unwrap_or_default();
        let documents = self.documents.into_iter().next().unwrap_or_default();
        let metadatas = self.metadatas.into_iter().next().unwrap_or_default();

        if distances.len() != ids.len() {
            return Err(VectorStoreError::InvalidResponse(format!(
                "{} ids but {} distances",
                ids.len(),
                distances.len()
            )));
        }

        let mut documents = documents.into_iter();
        let mut metadatas = metadatas.into_iter();
        Ok(ids
            .into_iter()
            .zip(distances)
            .map(|(id, distance)| QueryMatch {
                id,
                content: documents.next().flatten().unwrap_or_default(),
                metadata: metadatas.next().flatten().unwrap_or_default(),
                distance,
            })
            .collect())
    }
}

pub struct HttpVectorStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpVectorStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self, VectorStoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VectorStoreError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        collection: &str,
    ) -> Result<Response, VectorStoreError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(VectorStoreError::CollectionNotFound(collection.to_string()));
        }
        Err(VectorStoreError::ServerError {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, VectorStoreError> {
        response
            .json()
            .await
            .map_err(|e| VectorStoreError::InvalidResponse(e.to_string()))
    }
}

fn map_transport_error(e: reqwest::Error) -> VectorStoreError {
    if e.is_timeout() {
        VectorStoreError::Timeout
    } else if e.is_connect() {
        VectorStoreError::ConnectionError(e.to_string())
    } else {
        VectorStoreError::ClientError(e.to_string())
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn heartbeat(&self) -> Result<(), VectorStoreError> {
        self.send(self.request(Method::GET, "/heartbeat"), "")
            .await
            .map(|_| ())
    }

    async fn get_or_create_collection(
        &self,
        name: &str,
        metric: DistanceMetric,
    ) -> Result<Collection, VectorStoreError> {
        let body = CreateCollectionRequest {
            metric,
            get_or_create: true,
        };
        let response = self
            .send(
                self.request(Method::PUT, &format!("/collections/{}", name))
                    .json(&body),
                name,
            )
            .await?;

        // Some servers answer with an empty body.
        let text = response.text().await.unwrap_or_default();
        let info: CollectionResponse = serde_json::from_str(&text).unwrap_or_default();

        Ok(Collection {
            name: name.to_string(),
            id: info.id,
            metric,
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
        match self
            .send(
                self.request(Method::DELETE, &format!("/collections/{}", name)),
                name,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(VectorStoreError::CollectionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add(
        &self,
        collection: &Collection,
        records: &[VectorRecord],
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let body = AddRequest {
            ids: records.iter().map(|r| r.id.as_str()).collect(),
            documents: records.iter().map(|r| r.content.as_str()).collect(),
            embeddings: records.iter().map(|r| r.embedding.as_slice()).collect(),
            metadatas: records.iter().map(|r| r.metadata.to_map()).collect(),
        };

        self.send(
            self.request(
                Method::POST,
                &format!("/collections/{}/add", collection.name),
            )
            .json(&body),
            &collection.name,
        )
        .await
        .map(|_| ())
    }

    async fn query(
        &self,
        collection: &Collection,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>, VectorStoreError> {
        let body = QueryRequest {
            query_embeddings: vec![embedding],
            n_results,
            include: ["documents", "metadatas", "distances"],
            where_clause: filter.and_then(MetadataFilter::to_where),
        };

        let response = self
            .send(
                self.request(
                    Method::POST,
                    &format!("/collections/{}/query", collection.name),
                )
                .json(&body),
                &collection.name,
            )
            .await?;

        Self::json::<QueryResponse>(response).await?.into_matches()
    }

    async fn get(
        &self,
        collection: &Collection,
        filter: Option<&MetadataFilter>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage, VectorStoreError> {
        // The REST contract pages by offset; the cursor carries it.
        let offset = match cursor {
            Some(c) => c.parse::<usize>().map_err(|_| {
                VectorStoreError::InvalidRequest(format!("invalid scan cursor: {}", c))
            })?,
            None => 0,
        };
        let body = GetRequest {
            where_clause: filter.and_then(MetadataFilter::to_where),
            limit,
            offset,
            include: ["documents", "metadatas"],
        };

        let response = self
            .send(
                self.request(
                    Method::POST,
                    &format!("/collections/{}/get", collection.name),
                )
                .json(&body),
                &collection.name,
            )
            .await?;

        let page: GetResponse = Self::json(response).await?;
        let mut documents = page.documents.into_iter();
        let mut metadatas = page.metadatas.into_iter();
        let records: Vec<StoredRecord> = page
            .ids
            .into_iter()
            .map(|id| StoredRecord {
                id,
                content: documents.next().flatten().unwrap_or_default(),
                metadata: metadatas.next().flatten().unwrap_or_default(),
            })
            .collect();

        let next_cursor =
            (limit > 0 && records.len() >= limit).then(|| (offset + records.len()).to_string());
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
        let body = match selector {
            DeleteSelector::Ids(ids) => DeleteRequest {
                ids: Some(ids.clone()),
                where_clause: None,
            },
            DeleteSelector::Filter(filter) => DeleteRequest {
                ids: None,
                where_clause: filter.to_where(),
            },
        };

        self.send(
            self.request(
                Method::POST,
                &format!("/collections/{}/delete", collection.name),
            )
            .json(&body),
            &collection.name,
        )
        .await
        .map(|_| ())
    }

    async fn count(&self, collection: &Collection) -> Result<u64, VectorStoreError> {
        let response = self
            .send(
                self.request(
                    Method::GET,
                    &format!("/collections/{}/count", collection.name),
                ),
                &collection.name,
            )
            .await?;

        match Self::json::<CountResponse>(response).await? {
            CountResponse::Bare(n) | CountResponse::Wrapped { count: n } => Ok(n),
        }
    }

    fn driver(&self) -> VectorDriver {
        VectorDriver::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_request_wire_format() {
        let embedding = [0.5f32, 0.25];
        let filter = MetadataFilter::new().eq("processing_status", "completed");
        let body = QueryRequest {
            query_embeddings: vec![&embedding[..]],
            n_results: 5,
            include: ["documents", "metadatas", "distances"],
            where_clause: filter.to_where(),
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "queryEmbeddings": [[0.5, 0.25]],
                "nResults": 5,
                "include": ["documents", "metadatas", "distances"],
                "where": {"processing_status": "completed"}
            })
        );
    }

    #[test]
    fn test_query_request_omits_empty_where() {
        let embedding = [1.0f32];
        let body = QueryRequest {
            query_embeddings: vec![&embedding[..]],
            n_results: 1,
            include: ["documents", "metadatas", "distances"],
            where_clause: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("where").is_none());
    }

    #[test]
    fn test_query_response_is_index_aligned() {
        let response: QueryResponse = serde_json::from_value(json!({
            "ids": [["a", "b"]],
            "documents": [["doc a", null]],
            "metadatas": [[{"k": 1}, null]],
            "distances": [[0.1, 0.4]]
        }))
        .unwrap();

        let matches = response.into_matches().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].content, "doc a");
        assert_eq!(matches[0].metadata["k"], 1);
        assert_eq!(matches[1].content, "");
        assert!((matches[1].distance - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_query_response_mismatch_is_invalid() {
        let response: QueryResponse = serde_json::from_value(json!({
            "ids": [["a", "b"]],
            "distances": [[0.1]]
        }))
        .unwrap();
        assert!(matches!(
            response.into_matches(),
            Err(VectorStoreError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_empty_query_response() {
        let response: QueryResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.into_matches().unwrap().is_empty());
    }

    #[test]
    fn test_delete_request_wire_format() {
        let by_ids = DeleteRequest {
            ids: Some(vec!["x_chunk_0".into()]),
            where_clause: None,
        };
        assert_eq!(
            serde_json::to_value(&by_ids).unwrap(),
            json!({"ids": ["x_chunk_0"]})
        );

        let by_filter = DeleteRequest {
            ids: None,
            where_clause: MetadataFilter::new().eq("document_id", "x").to_where(),
        };
        assert_eq!(
            serde_json::to_value(&by_filter).unwrap(),
            json!({"where": {"document_id": "x"}})
        );
    }

    #[test]
    fn test_count_response_shapes() {
        let bare: CountResponse = serde_json::from_str("42").unwrap();
        let wrapped: CountResponse = serde_json::from_str(r#"{"count": 7}"#).unwrap();
        assert!(matches!(bare, CountResponse::Bare(42)));
        assert!(matches!(wrapped, CountResponse::Wrapped { count: 7 }));
    }

    #[test]
    fn test_create_body_uses_cosine() {
        let body = CreateCollectionRequest {
            metric: DistanceMetric::Cosine,
            get_or_create: true,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"metric": "cosine", "get_or_create": true})
        );
    }

    #[tokio::test]
    async fn test_unreachable_store_is_retryable() {
        use crate::utils::Retryable;

        let store = HttpVectorStore::new(&VectorStoreConfig {
            url: "http://127.0.0.1:9/".to_string(),
            timeout_secs: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(store.base_url(), "http://127.0.0.1:9");

        let err = store.heartbeat().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
