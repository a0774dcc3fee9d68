//! Bookkeeping collaborators: document/segment records, the query log and raw
//! object storage, with in-memory and local-filesystem implementations.

use crate::error::StoreError;
use crate::models::{Metadata, QueryLogEntry};
use crate::traits::{ObjectStore, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: String,
    /// `file`, `web` or `query_result`.
    pub source_type: String,
    pub source_path: Option<String>,
    /// Object store path of the raw bytes.
    pub storage_path: Option<String>,
    pub file_size: Option<usize>,
    pub page_count: Option<u64>,
    #[serde(default)]
    pub metadata: Metadata,
    pub is_processed: bool,
    pub is_indexed: bool,
    pub processing_error: Option<String>,
    pub collection_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, mime_type: impl Into<String>, source_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            filename: None,
            title: None,
            description: None,
            mime_type: mime_type.into(),
            source_type: source_type.to_string(),
            source_path: None,
            storage_path: None,
            file_size: None,
            page_count: None,
            metadata: Metadata::new(),
            is_processed: false,
            is_indexed: false,
            processing_error: None,
            collection_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub document_id: String,
    pub chunk_index: u64,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub vector_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordState {
    documents: BTreeMap<String, DocumentRecord>,
    segments: BTreeMap<String, Vec<SegmentRecord>>,
    #[serde(default)]
    query_log: Vec<QueryLogEntry>,
}

impl RecordState {
    fn delete_document(&mut self, document_id: &str) -> bool {
        self.segments.remove(document_id);
        self.documents.remove(document_id).is_some()
    }

    fn replace_segments(&mut self, document_id: &str, mut segments: Vec<SegmentRecord>) {
        segments.sort_by_key(|segment| segment.chunk_index);
        self.segments.insert(document_id.to_string(), segments);
    }

    fn segments(&self, document_id: &str) -> Vec<SegmentRecord> {
        self.segments.get(document_id).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: RwLock<RecordState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn query_log(&self) -> Vec<QueryLogEntry> {
        self.state.read().await.query_log.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_document(&self, record: DocumentRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .documents
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.state.read().await.documents.get(document_id).cloned())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.write().await.delete_document(document_id))
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .replace_segments(document_id, segments);
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        Ok(self.state.read().await.segments(document_id))
    }

    async fn log_query(&self, entry: QueryLogEntry) -> Result<(), StoreError> {
        self.state.write().await.query_log.push(entry);
        Ok(())
    }
}

/// Record store persisted as one JSON file, rewritten after every change. The
/// query log is appended to a JSON-lines file alongside it.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    log_path: PathBuf,
    state: Mutex<RecordState>,
}

impl JsonRecordStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut state: RecordState = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => RecordState::default(),
            Err(error) => return Err(error.into()),
        };
        state.query_log.clear();
        debug!(path = %path.display(), "record store opened");
        Ok(Self {
            log_path: path.with_extension("queries.jsonl"),
            path,
            state: Mutex::new(state),
        })
    }

    pub fn query_log_path(&self) -> &Path {
        &self.log_path
    }

    /// Applies `change` to a copy of the state and keeps it only once the
    /// file write succeeded.
    async fn commit<T>(&self, change: impl FnOnce(&mut RecordState) -> T) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let outcome = change(&mut next);
        self.persist(&next).await?;
        *state = next;
        Ok(outcome)
    }

    async fn persist(&self, state: &RecordState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn put_document(&self, record: DocumentRecord) -> Result<(), StoreError> {
        self.commit(|state| {
            state.documents.insert(record.id.clone(), record);
        })
        .await
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.state.lock().await.documents.get(document_id).cloned())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        if !self.state.lock().await.documents.contains_key(document_id) {
            return Ok(false);
        }
        self.commit(|state| state.delete_document(document_id)).await
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError> {
        self.commit(|state| state.replace_segments(document_id, segments))
            .await
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        Ok(self.state.lock().await.segments(document_id))
    }

    async fn log_query(&self, entry: QueryLogEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.state.lock().await;
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Stores objects as flat files under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Only the final path component is used, so objects never escape the root.
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let file_name = Path::new(name)
            .file_name()
            .filter(|file_name| !file_name.is_empty())
            .ok_or_else(|| StoreError::Request(format!("invalid object name: {name}")))?;
        Ok(self.root.join(file_name))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let path = self.resolve(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
