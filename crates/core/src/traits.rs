use crate::error::{ProviderError, StoreError};
use crate::models::{MetadataFilter, QueryLogEntry, ScoredSegment, Segment};
use crate::records::{DocumentRecord, SegmentRecord};
use async_trait::async_trait;

/// A segment ready for storage: its id, its embedding and the segment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub segment: Segment,
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the collection when it does not exist and returns the vector size
    /// it holds. Creation racing another writer is not an error.
    async fn ensure_collection(&self, collection: &str, dimensions: usize)
        -> Result<usize, StoreError>;

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<(), StoreError>;

    /// Nearest neighbours, closest first. Scores are distances: lower is closer.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>, StoreError>;

    /// Unknown ids are ignored.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Document and segment bookkeeping plus the query log.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    async fn put_document(&self, record: DocumentRecord) -> Result<(), StoreError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Removes the document and its segments. Returns whether it existed.
    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError>;

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError>;

    /// Segments of one document ordered by chunk index.
    async fn segments(&self, document_id: &str) -> Result<Vec<SegmentRecord>, StoreError>;

    async fn log_query(&self, entry: QueryLogEntry) -> Result<(), StoreError>;
}

/// Byte-addressable storage for raw uploads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores the bytes under `name` and returns the path to read them back.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Missing objects are ignored.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}
