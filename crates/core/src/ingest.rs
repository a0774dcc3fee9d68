//! Turns uploads, web pages and query results into indexed segments, keeping
//! the record store and object store in step with the vector index.

use crate::config::Settings;
use crate::error::IngestError;
use crate::models::{
    IngestReceipt, IngestStatus, Metadata, Segment, SourceMetadata, TabularData, CHUNK_INDEX_KEY,
    DOCUMENT_ID_KEY,
};
use crate::parsers::{
    essence, table_views, ParserKind, ParserRegistry, WebFetcher, CSV_MIME, DOCX_MIME, HTML_MIME,
    JSON_MIME, PDF_MIME, XLSX_MIME,
};
use crate::records::{DocumentRecord, SegmentRecord};
use crate::store::VectorStore;
use crate::traits::{ObjectStore, RecordStore};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

pub const DOCUMENTS_COLLECTION: &str = "documents";
pub const IMAGES_COLLECTION: &str = "images";
pub const WEB_PAGES_COLLECTION: &str = "web_pages";

const CHECKSUM_KEY: &str = "checksum";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    File,
    Web,
    QueryResult,
}

impl Origin {
    fn source_type(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Web => "web",
            Self::QueryResult => "query_result",
        }
    }
}

/// Logical collection for a source: images and web pages get their own.
fn logical_collection(origin: Origin, mime_type: &str) -> &'static str {
    match origin {
        Origin::Web => WEB_PAGES_COLLECTION,
        _ if ParserKind::for_mime(mime_type) == Some(ParserKind::Image) => IMAGES_COLLECTION,
        _ => DOCUMENTS_COLLECTION,
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "pdf" => PDF_MIME,
        "docx" => DOCX_MIME,
        "xlsx" => XLSX_MIME,
        "csv" => CSV_MIME,
        "json" => JSON_MIME,
        "html" | "htm" => HTML_MIME,
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(mime)
}

fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let extension = match essence(mime_type).as_str() {
        PDF_MIME => ".pdf",
        DOCX_MIME => ".docx",
        XLSX_MIME => ".xlsx",
        CSV_MIME => ".csv",
        JSON_MIME => ".json",
        HTML_MIME => ".html",
        "text/plain" => ".txt",
        "text/markdown" | "text/x-markdown" => ".md",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/webp" => ".webp",
        _ => return None,
    };
    Some(extension)
}

/// Lower-cased extension of `filename` including the dot, or one guessed
/// from the MIME type.
fn object_extension(filename: Option<&str>, mime_type: &str) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|extension| extension.to_str())
        .map(|extension| format!(".{}", extension.to_ascii_lowercase()))
        .or_else(|| extension_for_mime(mime_type).map(str::to_string))
        .unwrap_or_default()
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable vector id: identical content at the same position of the same
/// document always maps to the same point.
pub fn segment_id(document_id: &str, chunk_index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0]);
    hasher.update(chunk_index.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Document id for a file found on disk, derived from its path so rescans
/// replace the earlier ingest.
pub fn path_document_id(path: &Path) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes()).to_string()
}

pub fn discover_files(folder: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            });

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct IngestedFile {
    pub path: PathBuf,
    pub receipt: IngestReceipt,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FolderReport {
    pub ingested: Vec<IngestedFile>,
    /// Already indexed with the same checksum.
    pub unchanged: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedFile>,
}

/// State shared by every entry point between "record created" and "indexed".
/// `record` is only committed once indexing succeeds; until then an earlier
/// ingest keeps describing what the index holds.
struct Pending {
    record: DocumentRecord,
    previous: Option<DocumentRecord>,
    metadata: Metadata,
}

pub struct Ingestor {
    registry: Arc<ParserRegistry>,
    store: Arc<VectorStore>,
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    fetcher: WebFetcher,
    collections: BTreeMap<String, String>,
    max_upload_size: usize,
    extensions: Vec<String>,
}

impl Ingestor {
    pub fn new(
        registry: Arc<ParserRegistry>,
        store: Arc<VectorStore>,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        settings: &Settings,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            registry,
            store,
            records,
            objects,
            fetcher: WebFetcher::new(Duration::from_secs(settings.scraping_timeout_secs))?,
            collections: settings.collections.clone(),
            max_upload_size: settings.max_upload_size,
            extensions: settings.supported_extensions(),
        })
    }

    pub fn registry(&self) -> &Arc<ParserRegistry> {
        &self.registry
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    fn physical_collection(&self, logical: &str) -> String {
        self.collections
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    /// Stores, parses, chunks and indexes one upload.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        mime_type: &str,
        source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        if !self.registry.supports(mime_type) {
            warn!(mime_type, "no parser available");
            return Err(IngestError::UnsupportedMimeType(mime_type.to_string()));
        }

        let mut pending = self.begin(bytes, mime_type, &source, Origin::File).await?;
        let parsed = self
            .registry
            .parse(mime_type, bytes, &pending.metadata)
            .await;
        let collection = self.physical_collection(logical_collection(Origin::File, mime_type));
        self.finish(&mut pending, parsed, &collection).await
    }

    /// Fetches a page and indexes it into the web collection. Without a
    /// caller-supplied id the document id is derived from the URL.
    pub async fn ingest_url(
        &self,
        url: &str,
        mut source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        let html = self.fetcher.fetch(url).await?;
        let bytes = html.into_bytes();

        source
            .document_id
            .get_or_insert_with(|| Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string());
        source.source_path.get_or_insert_with(|| url.to_string());
        source.extra.insert("url".to_string(), json!(url));

        let mut pending = self.begin(&bytes, HTML_MIME, &source, Origin::Web).await?;
        let parsed = self.registry.parse(HTML_MIME, &bytes, &pending.metadata).await;
        let collection = self.physical_collection(logical_collection(Origin::Web, HTML_MIME));
        self.finish(&mut pending, parsed, &collection).await
    }

    /// Indexes the rows returned by an external query as table views.
    pub async fn ingest_query_result(
        &self,
        table: &TabularData,
        source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        let bytes = serde_json::to_vec(table)?;
        let mut pending = self
            .begin(&bytes, JSON_MIME, &source, Origin::QueryResult)
            .await?;
        pending.record.metadata.insert("row_count".to_string(), json!(table.row_count()));

        let mut metadata = pending.metadata.clone();
        metadata.insert("source".to_string(), json!("query_result"));
        metadata.insert("format".to_string(), json!("query_result"));
        let views = table_views(table, &metadata);
        let segments: Vec<Segment> = self
            .registry
            .chunker()
            .split_segments(&views)
            .await
            .into_iter()
            .filter(|segment| !segment.text.trim().is_empty())
            .collect();

        let collection =
            self.physical_collection(logical_collection(Origin::QueryResult, JSON_MIME));
        self.finish(&mut pending, Ok(segments), &collection).await
    }

    /// Ingests every supported file under `folder`, one at a time. Files that
    /// fail are reported and skipped; unchanged files are not reprocessed.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<FolderReport, IngestError> {
        let files = discover_files(folder, &self.extensions);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let mut report = FolderReport::default();
        for path in files {
            match self.ingest_path(&path).await {
                Ok(Some(receipt)) => report.ingested.push(IngestedFile { path, receipt }),
                Ok(None) => {
                    debug!(path = %path.display(), "unchanged, skipping");
                    report.unchanged.push(path);
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping file");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            folder = %folder.display(),
            ingested = report.ingested.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped_files.len(),
            "folder ingested"
        );
        Ok(report)
    }

    /// `None` when the file is already indexed with identical content.
    async fn ingest_path(&self, path: &Path) -> Result<Option<IngestReceipt>, IngestError> {
        let mime_type = mime_for_path(path).ok_or_else(|| {
            IngestError::UnsupportedMimeType(format!("unknown extension: {}", path.display()))
        })?;
        let bytes = tokio::fs::read(path).await?;
        let document_id = path_document_id(path);

        if let Some(previous) = self.records.get_document(&document_id).await? {
            let checksum = digest_bytes(&bytes);
            let same = previous
                .metadata
                .get(CHECKSUM_KEY)
                .and_then(|value| value.as_str())
                == Some(checksum.as_str());
            if same && previous.is_processed && previous.processing_error.is_none() {
                return Ok(None);
            }
        }

        let source = SourceMetadata {
            filename: path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string),
            document_id: Some(document_id),
            source_path: Some(path.to_string_lossy().into_owned()),
            ..SourceMetadata::default()
        };
        self.ingest(&bytes, mime_type, source).await.map(Some)
    }

    /// Removes the document's vectors, stored object and records.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        let record = self
            .records
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::DocumentNotFound(document_id.to_string()))?;

        let vector_ids: Vec<String> = self
            .records
            .segments(document_id)
            .await?
            .into_iter()
            .filter_map(|segment| segment.vector_id)
            .collect();
        if !vector_ids.is_empty() {
            let collection = record
                .collection_name
                .clone()
                .unwrap_or_else(|| self.physical_collection(DOCUMENTS_COLLECTION));
            self.store.delete(&vector_ids, &collection).await?;
        }

        if let Some(path) = &record.storage_path {
            if let Err(error) = self.objects.delete(path).await {
                warn!(document_id, path = %path, error = %error, "stored object not deleted");
            }
        }

        self.records.delete_document(document_id).await?;
        info!(document_id, vectors = vector_ids.len(), "document deleted");
        Ok(())
    }

    /// Checks the size limit, stores the raw bytes and writes the initial
    /// document record.
    async fn begin(
        &self,
        bytes: &[u8],
        mime_type: &str,
        source: &SourceMetadata,
        origin: Origin,
    ) -> Result<Pending, IngestError> {
        if bytes.len() > self.max_upload_size {
            return Err(IngestError::InvalidArgument(format!(
                "{} bytes exceeds the upload limit of {} bytes",
                bytes.len(),
                self.max_upload_size
            )));
        }

        let document_id = source
            .document_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(
            document_id = %document_id,
            mime_type,
            source_type = origin.source_type(),
            bytes = bytes.len(),
            "ingesting"
        );

        let previous = self.records.get_document(&document_id).await?;
        let object_name = format!(
            "{document_id}{}",
            object_extension(source.filename.as_deref(), mime_type)
        );
        let storage_path = self.objects.put(&object_name, bytes).await?;

        let mut record = DocumentRecord::new(&document_id, mime_type, origin.source_type());
        record.filename = source.filename.clone();
        record.title = source.filename.as_deref().and_then(|name| {
            Path::new(name)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        });
        record.description = source.description.clone();
        record.source_path = source.source_path.clone();
        record.storage_path = Some(storage_path);
        record.file_size = Some(bytes.len());
        record.metadata.insert("mime_type".to_string(), json!(mime_type));
        record.metadata.insert(CHECKSUM_KEY.to_string(), json!(digest_bytes(bytes)));
        if let Some(filename) = &source.filename {
            record.metadata.insert("filename".to_string(), json!(filename));
        }
        match &previous {
            Some(previous) => record.created_at = previous.created_at,
            None => self.records.put_document(record.clone()).await?,
        }

        let mut metadata = source.extra.clone();
        metadata.insert(DOCUMENT_ID_KEY.to_string(), json!(document_id));
        metadata.insert("mime_type".to_string(), json!(mime_type));
        for (key, value) in [
            ("filename", &source.filename),
            ("description", &source.description),
            ("source_path", &source.source_path),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), json!(value));
            }
        }

        Ok(Pending {
            record,
            previous,
            metadata,
        })
    }

    /// Indexes parsed segments, or records why the document could not be.
    async fn finish(
        &self,
        pending: &mut Pending,
        parsed: Result<Vec<Segment>, IngestError>,
        collection: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let outcome = match parsed {
            Ok(segments) => self.index_segments(pending, segments, collection).await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(receipt) => {
                if let Some(previous) = &pending.previous {
                    self.remove_object_if_moved(previous, &pending.record).await;
                }
                Ok(receipt)
            }
            Err(error) => {
                warn!(document_id = %pending.record.id, error = %error, "ingestion failed");
                let mut failed = pending
                    .previous
                    .clone()
                    .unwrap_or_else(|| pending.record.clone());
                if pending.previous.is_some() {
                    self.remove_object_if_moved(&pending.record, &failed).await;
                }
                failed.processing_error = Some(error.to_string());
                failed.touch();
                if let Err(store_error) = self.records.put_document(failed).await {
                    warn!(
                        document_id = %pending.record.id,
                        error = %store_error,
                        "failed to record processing error"
                    );
                }
                Err(error)
            }
        }
    }

    /// Deletes `replaced`'s stored object unless `kept` points at the same one.
    async fn remove_object_if_moved(&self, replaced: &DocumentRecord, kept: &DocumentRecord) {
        let Some(stale) = replaced
            .storage_path
            .as_deref()
            .filter(|stale| Some(*stale) != kept.storage_path.as_deref())
        else {
            return;
        };
        if let Err(error) = self.objects.delete(stale).await {
            warn!(document_id = %replaced.id, error = %error, "stale object not deleted");
        }
    }

    /// Vector ids an earlier ingest left in the index, with their collection.
    async fn indexed_vectors(
        &self,
        pending: &Pending,
        collection: &str,
    ) -> Result<Option<(String, Vec<String>)>, IngestError> {
        let Some(previous) = &pending.previous else {
            return Ok(None);
        };
        let ids: Vec<String> = self
            .records
            .segments(&previous.id)
            .await?
            .into_iter()
            .filter_map(|segment| segment.vector_id)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        let previous_collection = previous
            .collection_name
            .clone()
            .unwrap_or_else(|| collection.to_string());
        Ok(Some((previous_collection, ids)))
    }

    async fn index_segments(
        &self,
        pending: &mut Pending,
        segments: Vec<Segment>,
        collection: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let document_id = pending.record.id.clone();
        let indexed = self.indexed_vectors(pending, collection).await?;

        let segments: Vec<Segment> = segments
            .into_iter()
            .enumerate()
            .map(|(index, segment)| {
                segment
                    .with_entry(DOCUMENT_ID_KEY, document_id.clone())
                    .with_entry(CHUNK_INDEX_KEY, index)
            })
            .collect();

        let record = &mut pending.record;
        record.page_count = segments
            .iter()
            .find_map(|segment| segment.metadata.get("page_count"))
            .and_then(|value| value.as_u64());

        if segments.is_empty() {
            warn!(document_id = %document_id, "no content extracted");
            if let Some((previous_collection, stale)) = &indexed {
                self.store.delete(stale, previous_collection).await?;
            }
            self.records.replace_segments(&document_id, Vec::new()).await?;
            record.is_processed = true;
            record.is_indexed = false;
            record.collection_name = None;
            record.processing_error = Some("No content extracted from document".to_string());
            record.touch();
            self.records.put_document(record.clone()).await?;
            return Ok(IngestReceipt {
                document_id,
                chunk_count: 0,
                collection: None,
                status: IngestStatus::Empty,
                message: Some("Document processed but no content was extracted".to_string()),
            });
        }

        let ids: Vec<String> = segments
            .iter()
            .enumerate()
            .map(|(index, segment)| segment_id(&document_id, index, &segment.text))
            .collect();
        let vector_ids = self
            .store
            .add_documents(&segments, collection, Some(&ids))
            .await?;

        if let Some((previous_collection, previous_ids)) = &indexed {
            let stale: Vec<String> = previous_ids
                .iter()
                .filter(|id| previous_collection != collection || !vector_ids.contains(id))
                .cloned()
                .collect();
            if !stale.is_empty() {
                debug!(
                    document_id = %document_id,
                    collection = %previous_collection,
                    count = stale.len(),
                    "removing stale segments"
                );
                self.store.delete(&stale, previous_collection).await?;
            }
        }

        let rows = segments
            .iter()
            .zip(vector_ids)
            .enumerate()
            .map(|(index, (segment, vector_id))| SegmentRecord {
                document_id: document_id.clone(),
                chunk_index: index as u64,
                content: segment.text.clone(),
                metadata: segment.metadata.clone(),
                vector_id: Some(vector_id),
            })
            .collect();
        self.records.replace_segments(&document_id, rows).await?;

        record.is_processed = true;
        record.is_indexed = true;
        record.processing_error = None;
        record.collection_name = Some(collection.to_string());
        record.touch();
        self.records.put_document(record.clone()).await?;

        info!(
            document_id = %document_id,
            collection,
            segments = segments.len(),
            "document indexed"
        );
        Ok(IngestReceipt {
            document_id,
            chunk_count: segments.len(),
            collection: Some(collection.to_string()),
            status: IngestStatus::Indexed,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunker, ChunkingConfig};
    use crate::embeddings::{CharacterNgramEmbedder, Embedder};
    use crate::error::ProviderError;
    use crate::parsers::{OcrEngine, PageText};
    use crate::records::{FsObjectStore, InMemoryRecordStore};
    use crate::stores::InMemoryStore;
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Harness {
        ingestor: Ingestor,
        backend: Arc<InMemoryStore>,
        records: Arc<InMemoryRecordStore>,
        objects_dir: PathBuf,
        _dir: TempDir,
    }

    fn harness(settings: Settings) -> Result<Harness, Box<dyn std::error::Error>> {
        harness_with(settings, Arc::new(CharacterNgramEmbedder { dimensions: 32 }), None)
    }

    fn harness_with(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        ocr: Option<Arc<dyn OcrEngine>>,
    ) -> Result<Harness, Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let objects_dir = dir.path().join("objects");
        let backend = Arc::new(InMemoryStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let store = Arc::new(VectorStore::new(backend.clone(), embedder));
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 20,
            min_chunk_size: 0,
            ..ChunkingConfig::default()
        })?;
        let ingestor = Ingestor::new(
            Arc::new(ParserRegistry::with_defaults(chunker, ocr)),
            store,
            records.clone(),
            Arc::new(FsObjectStore::new(objects_dir.clone())),
            &settings,
        )?;
        Ok(Harness {
            ingestor,
            backend,
            records,
            objects_dir,
            _dir: dir,
        })
    }

    /// Embeds like the n-gram embedder until switched off.
    struct SwitchableEmbedder {
        inner: CharacterNgramEmbedder,
        down: AtomicBool,
    }

    #[async_trait]
    impl Embedder for SwitchableEmbedder {
        fn name(&self) -> &str {
            "switchable"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("embedding service down".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    struct SignOcr;

    #[async_trait]
    impl OcrEngine for SignOcr {
        async fn recognize(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            _source: &str,
        ) -> Result<Vec<PageText>, IngestError> {
            Ok(vec![PageText {
                number: 1,
                text: "EMERGENCY EXIT".to_string(),
            }])
        }
    }

    fn png() -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(4, 4, Rgb([0, 120, 0]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    fn named(filename: &str, document_id: Option<&str>) -> SourceMetadata {
        SourceMetadata {
            filename: Some(filename.to_string()),
            document_id: document_id.map(str::to_string),
            ..SourceMetadata::default()
        }
    }

    #[test]
    fn mime_types_follow_extensions() {
        assert_eq!(mime_for_path(Path::new("a/b/Report.PDF")), Some(PDF_MIME));
        assert_eq!(mime_for_path(Path::new("notes.md")), Some("text/markdown"));
        assert_eq!(mime_for_path(Path::new("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("archive.zip")), None);
        assert_eq!(object_extension(Some("Scan.PNG"), "image/png"), ".png");
        assert_eq!(object_extension(None, "text/plain; charset=utf-8"), ".txt");
        assert_eq!(object_extension(None, "application/zip"), "");
    }

    #[test]
    fn segment_ids_are_deterministic() {
        let first = segment_id("doc", 0, "alpha");
        assert_eq!(first, segment_id("doc", 0, "alpha"));
        assert_ne!(first, segment_id("doc", 1, "alpha"));
        assert_ne!(first, segment_id("other", 0, "alpha"));
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn upload_is_stored_recorded_and_indexed() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let receipt = h
            .ingestor
            .ingest(
                b"Valves must be inspected every month.",
                "text/plain",
                named("valves.txt", Some("doc-1")),
            )
            .await?;

        assert_eq!(receipt.status, IngestStatus::Indexed);
        assert_eq!(receipt.chunk_count, 1);
        assert_eq!(receipt.collection.as_deref(), Some(DOCUMENTS_COLLECTION));
        assert!(h.objects_dir.join("doc-1.txt").exists());

        let record = h.records.get_document("doc-1").await?.ok_or("record missing")?;
        assert!(record.is_processed && record.is_indexed);
        assert_eq!(record.title.as_deref(), Some("valves"));
        assert_eq!(record.source_type, "file");

        let segments = h.records.segments("doc-1").await?;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].metadata[DOCUMENT_ID_KEY], json!("doc-1"));
        assert_eq!(segments[0].metadata[CHUNK_INDEX_KEY], json!(0));
        let vector_id = segments[0].vector_id.clone().ok_or("vector id missing")?;
        assert_eq!(h.backend.ids(DOCUMENTS_COLLECTION).await, vec![vector_id]);
        Ok(())
    }

    #[tokio::test]
    async fn reingest_replaces_previous_segments() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let long = "Pumps need seals. ".repeat(40);
        let first = h
            .ingestor
            .ingest(long.as_bytes(), "text/plain", named("pumps.txt", Some("doc-1")))
            .await?;
        assert!(first.chunk_count > 1);

        let again = h
            .ingestor
            .ingest(long.as_bytes(), "text/plain", named("pumps.txt", Some("doc-1")))
            .await?;
        assert_eq!(again.chunk_count, first.chunk_count);
        assert_eq!(h.backend.len(DOCUMENTS_COLLECTION).await, first.chunk_count);

        h.ingestor
            .ingest(b"Short now.", "text/plain", named("pumps.txt", Some("doc-1")))
            .await?;
        assert_eq!(h.backend.len(DOCUMENTS_COLLECTION).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_inputs_are_typed_errors() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings {
            max_upload_size: 8,
            ..Settings::default()
        })?;

        let unsupported = h
            .ingestor
            .ingest(b"PK", "application/zip", named("a.zip", None))
            .await;
        assert!(matches!(unsupported, Err(IngestError::UnsupportedMimeType(_))));

        let oversized = h
            .ingestor
            .ingest(b"way past the limit", "text/plain", named("a.txt", None))
            .await;
        assert!(matches!(oversized, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn parse_failures_are_recorded() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let result = h
            .ingestor
            .ingest(b"not a zip", DOCX_MIME, named("broken.docx", Some("doc-9")))
            .await;
        assert!(matches!(result, Err(IngestError::DocxParse(_))));

        let record = h.records.get_document("doc-9").await?.ok_or("record missing")?;
        assert!(!record.is_indexed);
        assert!(record.processing_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn blank_documents_are_processed_but_not_indexed() -> Result<(), Box<dyn std::error::Error>>
    {
        let h = harness(Settings::default())?;
        let receipt = h
            .ingestor
            .ingest(b"  \n\n ", "text/plain", named("blank.txt", Some("doc-2")))
            .await?;
        assert_eq!(receipt.status, IngestStatus::Empty);
        assert_eq!(receipt.chunk_count, 0);

        let record = h.records.get_document("doc-2").await?.ok_or("record missing")?;
        assert!(record.is_processed);
        assert!(!record.is_indexed);
        Ok(())
    }

    #[tokio::test]
    async fn query_results_become_table_views() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let table = TabularData::new(
            vec!["pump".to_string(), "pressure".to_string()],
            vec![vec![json!("P-1"), json!(4.5)], vec![json!("P-2"), json!(3.9)]],
        );
        let receipt = h
            .ingestor
            .ingest_query_result(&table, named("pressures", Some("q-1")))
            .await?;
        assert_eq!(receipt.status, IngestStatus::Indexed);

        let segments = h.records.segments("q-1").await?;
        let views: Vec<_> = segments
            .iter()
            .filter_map(|segment| segment.metadata["representation"].as_str())
            .collect();
        assert!(views.contains(&"full_table"));
        assert!(views.contains(&"columns"));

        let record = h.records.get_document("q-1").await?.ok_or("record missing")?;
        assert_eq!(record.source_type, "query_result");
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingest_skips_broken_and_unchanged_files(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let folder = tempdir()?;
        let nested = folder.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(folder.path().join("a.txt"), "Boilers are drained yearly.")?;
        fs::write(nested.join("b.md"), "# Fans\n\nFans are cleaned weekly.")?;
        fs::write(folder.path().join("c.docx"), "not really a docx")?;
        fs::write(folder.path().join("ignored.zip"), "zip")?;

        let report = h.ingestor.ingest_folder(folder.path()).await?;
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("c.docx")
        );

        let rerun = h.ingestor.ingest_folder(folder.path()).await?;
        assert!(rerun.ingested.is_empty());
        assert_eq!(rerun.unchanged.len(), 2);
        assert_eq!(rerun.skipped_files.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_folder_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(Settings::default())?;
        let folder = tempdir()?;
        let result = h.ingestor.ingest_folder(folder.path()).await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_vectors_objects_and_records() -> Result<(), Box<dyn std::error::Error>>
    {
        let h = harness(Settings::default())?;
        h.ingestor
            .ingest(b"Chillers run at 6C.", "text/plain", named("chill.txt", Some("doc-3")))
            .await?;
        assert_eq!(h.backend.len(DOCUMENTS_COLLECTION).await, 1);

        h.ingestor.delete_document("doc-3").await?;
        assert_eq!(h.backend.len(DOCUMENTS_COLLECTION).await, 0);
        assert!(!h.objects_dir.join("doc-3.txt").exists());
        assert!(h.records.get_document("doc-3").await?.is_none());

        let missing = h.ingestor.delete_document("doc-3").await;
        assert!(matches!(missing, Err(IngestError::DocumentNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn failed_reparse_keeps_the_indexed_state() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness_with(
            Settings::default(),
            Arc::new(CharacterNgramEmbedder { dimensions: 32 }),
            Some(Arc::new(SignOcr)),
        )?;
        let receipt = h
            .ingestor
            .ingest(&png()?, "image/png", named("exit.png", Some("img")))
            .await?;
        assert_eq!(receipt.collection.as_deref(), Some(IMAGES_COLLECTION));
        assert_eq!(h.backend.len(IMAGES_COLLECTION).await, 1);

        let failed = h
            .ingestor
            .ingest(b"not a png", "image/png", named("exit.png", Some("img")))
            .await;
        assert!(matches!(failed, Err(IngestError::Image(_))));

        let record = h.records.get_document("img").await?.ok_or("record missing")?;
        assert!(record.is_indexed);
        assert_eq!(record.collection_name.as_deref(), Some(IMAGES_COLLECTION));
        assert!(record.processing_error.is_some());
        let vector_ids: Vec<String> = h
            .records
            .segments("img")
            .await?
            .into_iter()
            .filter_map(|segment| segment.vector_id)
            .collect();
        assert_eq!(h.backend.ids(IMAGES_COLLECTION).await, vector_ids);

        h.ingestor.delete_document("img").await?;
        assert_eq!(h.backend.len(IMAGES_COLLECTION).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn embedding_outage_during_reingest_keeps_old_vectors(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let embedder = Arc::new(SwitchableEmbedder {
            inner: CharacterNgramEmbedder { dimensions: 32 },
            down: AtomicBool::new(false),
        });
        let h = harness_with(Settings::default(), embedder.clone(), None)?;
        h.ingestor
            .ingest(
                b"Boilers are drained yearly.",
                "text/plain",
                named("boilers.txt", Some("doc-7")),
            )
            .await?;
        let before = h.backend.ids(DOCUMENTS_COLLECTION).await;
        assert_eq!(before.len(), 1);

        embedder.down.store(true, Ordering::SeqCst);
        let failed = h
            .ingestor
            .ingest(
                b"Boilers are drained monthly.",
                "text/plain",
                named("boilers.txt", Some("doc-7")),
            )
            .await;
        assert!(matches!(failed, Err(IngestError::Store(_))));
        assert_eq!(h.backend.ids(DOCUMENTS_COLLECTION).await, before);
        let rows = h.records.segments("doc-7").await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vector_id.as_ref(), before.first());
        let record = h.records.get_document("doc-7").await?.ok_or("record missing")?;
        assert!(record.is_indexed);

        embedder.down.store(false, Ordering::SeqCst);
        h.ingestor
            .ingest(
                b"Boilers are drained monthly.",
                "text/plain",
                named("boilers.txt", Some("doc-7")),
            )
            .await?;
        let after = h.backend.ids(DOCUMENTS_COLLECTION).await;
        assert_eq!(after.len(), 1);
        assert_ne!(after, before);
        let record = h.records.get_document("doc-7").await?.ok_or("record missing")?;
        assert!(record.processing_error.is_none());
        Ok(())
    }
}
