use crate::error::StoreError;
use crate::models::{FilterCondition, Metadata, MetadataFilter, ScoredSegment, Segment};
use crate::traits::{StoredPoint, VectorBackend};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

const BACKEND: &str = "qdrant";

/// Qdrant over its REST API. Segments are stored as `{text, metadata, segment_id}`
/// payloads in cosine-distance collections.
pub struct QdrantStore {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: None,
            client: Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn request(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.endpoint, collection)
    }

    async fn create_collection(&self, collection: &str, dimensions: usize) -> Result<(), StoreError> {
        let response = self
            .request(self.client.put(self.collection_url(collection)))
            .json(&json!({ "vectors": { "size": dimensions, "distance": "Cosine" } }))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT || body.contains("already exists") {
            debug!(collection, "collection created concurrently");
            return Ok(());
        }
        Err(backend_error(status, &body))
    }

    async fn vector_size(&self, collection: &str) -> Result<Option<usize>, StoreError> {
        let response = self
            .request(self.client.get(self.collection_url(collection)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed = checked_json(response).await?;
        let size = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("collection {collection} has no single vector size"),
            })?;
        Ok(Some(size as usize))
    }
}

/// Qdrant only accepts UUIDs or integers as point ids.
pub fn point_id(id: &str) -> String {
    Uuid::parse_str(id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()))
        .to_string()
}

fn filter_body(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .conditions()
        .map(|(key, condition)| {
            let matcher = match condition {
                FilterCondition::Equals(value) => json!({ "value": value }),
                FilterCondition::In(values) => json!({ "any": values }),
            };
            json!({ "key": format!("metadata.{key}"), "match": matcher })
        })
        .collect();
    json!({ "must": must })
}

fn backend_error(status: StatusCode, body: &str) -> StoreError {
    StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    }
}

async fn checked_json(response: Response) -> Result<Value, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(backend_error(status, &body));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl VectorBackend for QdrantStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<usize, StoreError> {
        if let Some(size) = self.vector_size(collection).await? {
            return Ok(size);
        }
        self.create_collection(collection, dimensions).await?;
        Ok(self.vector_size(collection).await?.unwrap_or(dimensions))
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let points: Vec<Value> = points
            .into_iter()
            .map(|point| {
                json!({
                    "id": point_id(&point.id),
                    "vector": point.vector,
                    "payload": {
                        "text": point.segment.text,
                        "metadata": point.segment.metadata,
                        "segment_id": point.id,
                    },
                })
            })
            .collect();

        let response = self
            .request(self.client.put(format!(
                "{}/points?wait=true",
                self.collection_url(collection)
            )))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        checked_json(response).await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>, StoreError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter.filter(|filter| !filter.is_empty()) {
            body["filter"] = filter_body(filter);
        }

        let response = self
            .request(
                self.client
                    .post(format!("{}/points/search", self.collection_url(collection))),
            )
            .json(&body)
            .send()
            .await?;
        let parsed = checked_json(response).await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::with_capacity(hits.len());
        for hit in hits {
            let text = hit
                .pointer("/payload/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let metadata: Metadata = hit
                .pointer("/payload/metadata")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            let similarity = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);

            result.push(ScoredSegment {
                segment: Segment::new(text, metadata),
                score: (1.0 - similarity) as f32,
            });
        }

        Ok(result)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .request(self.client.post(format!(
                "{}/points/delete?wait=true",
                self.collection_url(collection)
            )))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        checked_json(response).await?;
        Ok(())
    }
}
