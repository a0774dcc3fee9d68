use crate::embeddings::Embedder;
use crate::error::StoreError;
use crate::models::{MetadataFilter, ScoredSegment, Segment};
use crate::traits::{StoredPoint, VectorBackend};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Texts sent to the embedding provider per request.
pub const EMBED_BATCH_SIZE: usize = 64;

const PROBE_TEXT: &str = "Test embedding";

/// A named partition of the index bound to one embedding dimensionality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub dimensions: usize,
}

/// Embeds segments with the process-wide provider and stores them in named
/// collections of a vector backend.
pub struct VectorStore {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl VectorStore {
    pub fn new(backend: Arc<dyn VectorBackend>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            backend,
            embedder,
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Returns the cached handle, creating the collection on first use. The
    /// embedding provider is probed once so that a broken provider fails here.
    pub async fn get_collection(&self, name: &str) -> Result<Arc<Collection>, StoreError> {
        if let Some(existing) = self.collections.read().await.get(name) {
            return Ok(Arc::clone(existing));
        }

        let probe = self.embedder.embed(PROBE_TEXT).await?;
        let dimensions = probe.len();
        if dimensions == 0 {
            return Err(StoreError::Request(format!(
                "embedding provider {} returned an empty vector",
                self.embedder.name()
            )));
        }

        let stored = self.backend.ensure_collection(name, dimensions).await?;
        if stored != dimensions {
            return Err(StoreError::DimensionMismatch {
                collection: name.to_string(),
                expected: stored,
                actual: dimensions,
            });
        }

        let mut collections = self.collections.write().await;
        let handle = collections
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(
                    collection = name,
                    dimensions,
                    backend = self.backend.name(),
                    embedder = self.embedder.name(),
                    "collection ready"
                );
                Arc::new(Collection {
                    name: name.to_string(),
                    dimensions,
                })
            });
        Ok(Arc::clone(handle))
    }

    /// Embeds and stores segments. Returns one id per segment in input order;
    /// caller-supplied ids replace earlier points with the same id.
    pub async fn add_documents(
        &self,
        segments: &[Segment],
        collection: &str,
        ids: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError> {
        if let Some(ids) = ids {
            if ids.len() != segments.len() {
                return Err(StoreError::Request(format!(
                    "{} ids supplied for {} segments",
                    ids.len(),
                    segments.len()
                )));
            }
        }

        let handle = self.get_collection(collection).await?;
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => segments.iter().map(|_| Uuid::new_v4().to_string()).collect(),
        };

        let mut points = Vec::with_capacity(segments.len());
        for (batch_index, batch) in segments.chunks(EMBED_BATCH_SIZE).enumerate() {
            let texts: Vec<String> = batch.iter().map(|segment| segment.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(StoreError::Request(format!(
                    "embedding provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (offset, (segment, vector)) in batch.iter().zip(vectors).enumerate() {
                if vector.len() != handle.dimensions {
                    return Err(StoreError::DimensionMismatch {
                        collection: handle.name.clone(),
                        expected: handle.dimensions,
                        actual: vector.len(),
                    });
                }
                points.push(StoredPoint {
                    id: ids[batch_index * EMBED_BATCH_SIZE + offset].clone(),
                    vector,
                    segment: segment.clone(),
                });
            }
        }

        debug!(collection, count = points.len(), "storing segments");
        self.backend.upsert(&handle.name, points).await?;
        Ok(ids)
    }

    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<Segment>, StoreError> {
        Ok(self
            .search_with_score(query, collection, filter, k)
            .await?
            .into_iter()
            .map(|scored| scored.segment)
            .collect())
    }

    /// Nearest segments with their distance, closest first.
    pub async fn search_with_score(
        &self,
        query: &str,
        collection: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredSegment>, StoreError> {
        let handle = self.get_collection(collection).await?;
        let vector = self.embedder.embed(query).await?;
        if vector.len() != handle.dimensions {
            return Err(StoreError::DimensionMismatch {
                collection: handle.name.clone(),
                expected: handle.dimensions,
                actual: vector.len(),
            });
        }
        self.backend.query(&handle.name, &vector, filter, k).await
    }

    /// Unknown ids and collections are not errors.
    pub async fn delete(&self, ids: &[String], collection: &str) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.backend.delete(collection, ids).await
    }
}
