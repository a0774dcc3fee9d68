use crate::embeddings::cosine_similarity;
use crate::error::StoreError;
use crate::models::{MetadataFilter, ScoredSegment};
use crate::traits::{StoredPoint, VectorBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryCollection {
    dimensions: usize,
    /// Insertion order; an upsert of a known id replaces it in place.
    points: Vec<StoredPoint>,
}

/// Process-local vector backend with exact cosine search.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|collection| collection.points.len())
            .unwrap_or(0)
    }

    pub async fn ids(&self, collection: &str) -> Vec<String> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|collection| collection.points.iter().map(|point| point.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorBackend for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<usize, StoreError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection {
                dimensions,
                points: Vec::new(),
            });
        Ok(entry.dimensions)
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Request(format!("unknown collection {collection}")))?;

        for point in points {
            if point.vector.len() != target.dimensions {
                return Err(StoreError::DimensionMismatch {
                    collection: collection.to_string(),
                    expected: target.dimensions,
                    actual: point.vector.len(),
                });
            }
            match target.points.iter_mut().find(|stored| stored.id == point.id) {
                Some(stored) => *stored = point,
                None => target.points.push(point),
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>, StoreError> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredSegment> = target
            .points
            .iter()
            .filter(|point| filter.map_or(true, |filter| filter.matches(&point.segment.metadata)))
            .map(|point| ScoredSegment {
                segment: point.segment.clone(),
                score: 1.0 - cosine_similarity(vector, &point.vector),
            })
            .collect();

        scored.sort_by(|left, right| left.score.total_cmp(&right.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(target) = collections.get_mut(collection) {
            target.points.retain(|point| !ids.contains(&point.id));
        }
        Ok(())
    }
}
