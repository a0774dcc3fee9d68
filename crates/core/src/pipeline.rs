//! The operations exposed to callers, over explicitly wired collaborators.

use crate::chunking::Chunker;
use crate::config::{Settings, VectorBackendKind};
use crate::embeddings::build_embedder;
use crate::error::{IngestError, PipelineError};
use crate::extraction::StructuredExtractor;
use crate::generation::Generator;
use crate::ingest::{FolderReport, Ingestor};
use crate::models::{
    ExtractionRequest, ExtractionResult, GenerationResult, IngestReceipt, RetrievalRequest,
    RetrievalResult, SourceMetadata, TabularData,
};
use crate::parsers::{HttpOcrEngine, OcrEngine, ParserRegistry};
use crate::records::{FsObjectStore, JsonRecordStore};
use crate::retrieval::Retriever;
use crate::store::VectorStore;
use crate::stores::{InMemoryStore, QdrantStore};
use crate::traits::{ObjectStore, RecordStore, VectorBackend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const RECORDS_FILE: &str = "records.json";
pub const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(flatten)]
    pub retrieval: RetrievalRequest,
    /// Answer with the language model instead of returning the matches.
    #[serde(default)]
    pub generate: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            retrieval: RetrievalRequest::new(query),
            generate: false,
        }
    }

    pub fn generating(mut self) -> Self {
        self.generate = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResponse {
    Retrieval(RetrievalResult),
    Generation(GenerationResult),
}

pub struct RagPipeline {
    ingestor: Ingestor,
    generator: Arc<Generator>,
    extractor: StructuredExtractor,
}

impl RagPipeline {
    pub fn new(ingestor: Ingestor, generator: Arc<Generator>) -> Self {
        let extractor =
            StructuredExtractor::new(Arc::clone(&generator), Arc::clone(ingestor.records()));
        Self {
            ingestor,
            generator,
            extractor,
        }
    }

    /// Builds every collaborator from settings: the configured vector backend
    /// and embedder, JSON records and file objects under `data_dir`, optional
    /// OCR, and a language model with provider fallback.
    pub async fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        let embedder = build_embedder(settings)?;
        let backend: Arc<dyn VectorBackend> = match settings.vector_backend {
            VectorBackendKind::Qdrant => Arc::new(
                QdrantStore::new(settings.qdrant_url.clone())
                    .with_api_key(settings.qdrant_api_key.clone()),
            ),
            VectorBackendKind::Memory => Arc::new(InMemoryStore::new()),
        };
        let store = Arc::new(VectorStore::new(backend, Arc::clone(&embedder)));

        let records: Arc<dyn RecordStore> =
            Arc::new(JsonRecordStore::open(settings.data_dir.join(RECORDS_FILE)).await?);
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(settings.data_dir.join(OBJECTS_DIR)));
        let ocr = HttpOcrEngine::from_settings(settings)
            .map(|engine| Arc::new(engine) as Arc<dyn OcrEngine>);

        let chunker = Chunker::new(settings.chunking_config())?.with_embedder(embedder);
        let registry = Arc::new(ParserRegistry::with_defaults(chunker, ocr));
        let ingestor = Ingestor::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&records),
            objects,
            settings,
        )?;

        let retriever = Arc::new(Retriever::new(
            store,
            settings.all_collections(),
            settings.max_retrieved_documents,
        ));
        let generator = Generator::from_settings(retriever, settings)
            .await
            .with_records(records);

        info!(
            backend = ?settings.vector_backend,
            data_dir = %settings.data_dir.display(),
            generation = generator.is_available(),
            "pipeline ready"
        );
        Ok(Self::new(ingestor, Arc::new(generator)))
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub async fn ingest(
        &self,
        bytes: &[u8],
        mime_type: &str,
        source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        self.ingestor.ingest(bytes, mime_type, source).await
    }

    pub async fn ingest_query_result(
        &self,
        table: &TabularData,
        source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        self.ingestor.ingest_query_result(table, source).await
    }

    pub async fn ingest_url(
        &self,
        url: &str,
        source: SourceMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        self.ingestor.ingest_url(url, source).await
    }

    pub async fn ingest_folder(&self, folder: &Path) -> Result<FolderReport, IngestError> {
        self.ingestor.ingest_folder(folder).await
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        self.ingestor.delete_document(document_id).await
    }

    /// Retrieval only, or a generated answer when `generate` is set.
    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        if request.generate {
            QueryResponse::Generation(self.generator.generate(&request.retrieval).await)
        } else {
            QueryResponse::Retrieval(self.generator.retriever().retrieve(&request.retrieval).await)
        }
    }

    pub async fn extract_structured(&self, request: &ExtractionRequest) -> ExtractionResult {
        self.extractor.extract(request).await
    }

    /// Active chunking, backend and language model state.
    pub fn describe(&self) -> Value {
        json!({
            "chunking": self.ingestor.registry().chunker().describe(),
            "vector_backend": self.generator.retriever().store().backend_name(),
            "generator": format!("{:?}", self.generator.state()),
        })
    }
}
