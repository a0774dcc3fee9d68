use async_trait::async_trait;
use rag_pipeline_core::chunking::{Chunker, ChunkingConfig};
use rag_pipeline_core::generation::NO_CONTEXT_ANSWER;
use rag_pipeline_core::parsers::{
    PageText, PdfContent, PdfExtractor, PdfParser, DOCX_MIME, PDF_MIME,
};
use rag_pipeline_core::{
    CharacterNgramEmbedder, ExtractionRequest, ExtractionStatus, ExtractionStrategy, Generator,
    GenerationStatus, InMemoryRecordStore, InMemoryStore, IngestError, IngestStatus, Ingestor,
    LanguageModel, ObjectStore, ParserRegistry, ProviderError, QueryRequest, QueryResponse,
    RagPipeline, RecordStore, Retriever, Settings, SourceMetadata, StoreError, VectorStore,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct ThreePagePdf;

impl PdfExtractor for ThreePagePdf {
    fn extract(&self, _bytes: &[u8]) -> Result<PdfContent, IngestError> {
        let page = |number: u32, text: &str| PageText {
            number,
            text: text.to_string(),
        };
        Ok(PdfContent {
            page_count: 4,
            info: BTreeMap::from([("title".to_string(), "Pump Manual".to_string())]),
            pages: vec![
                page(1, "Page 1 covers pump installation."),
                page(2, "Page 2 covers seal replacement."),
                page(3, "   "),
                page(4, "Page 4 covers the warranty terms and conditions."),
            ],
        })
    }
}

/// Answers the smoke test, then replays `reply` for every other prompt.
struct ScriptedModel {
    reply: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_reply(&self, reply: &str) {
        if let Ok(mut current) = self.reply.lock() {
            *current = reply.to_string();
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply
            .lock()
            .map(|reply| reply.clone())
            .map_err(|_| ProviderError::Unavailable("poisoned".to_string()))
    }
}

/// Keeps objects in memory so tests leave nothing on disk.
#[derive(Default)]
struct MemoryObjects {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StoreError::Request("poisoned".to_string()))?;
        objects.insert(name.to_string(), bytes.to_vec());
        Ok(format!("memory/{name}"))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| StoreError::Request("poisoned".to_string()))?;
        let name = path.trim_start_matches("memory/");
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Request(format!("missing object {path}")))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StoreError::Request("poisoned".to_string()))?;
        objects.remove(path.trim_start_matches("memory/"));
        Ok(())
    }
}

struct Fixture {
    pipeline: RagPipeline,
    backend: Arc<InMemoryStore>,
    records: Arc<InMemoryRecordStore>,
    model: Arc<ScriptedModel>,
}

async fn fixture() -> Result<Fixture, Box<dyn std::error::Error>> {
    let settings = Settings::default();
    let backend = Arc::new(InMemoryStore::new());
    let records = Arc::new(InMemoryRecordStore::new());
    let store = Arc::new(VectorStore::new(
        backend.clone(),
        Arc::new(CharacterNgramEmbedder { dimensions: 64 }),
    ));

    let chunker = Chunker::new(ChunkingConfig {
        min_chunk_size: 0,
        ..ChunkingConfig::default()
    })?;
    let registry = ParserRegistry::with_defaults(chunker, None)
        .register(Arc::new(PdfParser::new(Arc::new(ThreePagePdf), None)));
    let ingestor = Ingestor::new(
        Arc::new(registry),
        store.clone(),
        records.clone(),
        Arc::new(MemoryObjects::default()),
        &settings,
    )?;

    let model = ScriptedModel::new("The seals are replaced yearly.");
    let retriever = Arc::new(Retriever::new(
        store,
        settings.all_collections(),
        settings.max_retrieved_documents,
    ));
    let generator = Generator::initialize(
        retriever,
        Ok(model.clone() as Arc<dyn LanguageModel>),
        Err(ProviderError::Unavailable("secondary not configured".to_string())),
    )
    .await
    .with_records(records.clone());

    Ok(Fixture {
        pipeline: RagPipeline::new(ingestor, Arc::new(generator)),
        backend,
        records,
        model,
    })
}

fn source(filename: &str, document_id: &str) -> SourceMetadata {
    SourceMetadata {
        filename: Some(filename.to_string()),
        document_id: Some(document_id.to_string()),
        ..SourceMetadata::default()
    }
}

fn schema(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn three_page_pdf_drops_the_blank_page() -> TestResult {
    let f = fixture().await?;
    let receipt = f
        .pipeline
        .ingest(b"%PDF-1.7", PDF_MIME, source("manual.pdf", "manual"))
        .await?;

    assert_eq!(receipt.status, IngestStatus::Indexed);
    assert_eq!(receipt.chunk_count, 3);
    assert_eq!(receipt.collection.as_deref(), Some("documents"));
    assert_eq!(f.backend.len("documents").await, 3);

    let segments = f.records.segments("manual").await?;
    let pages: Vec<_> = segments.iter().map(|segment| segment.metadata["page"].clone()).collect();
    assert_eq!(pages, vec![json!(1), json!(2), json!(4)]);
    assert_eq!(segments[0].metadata["title"], json!("Pump Manual"));

    let record = f.records.get_document("manual").await?.ok_or("record missing")?;
    assert_eq!(record.page_count, Some(4));
    Ok(())
}

#[tokio::test]
async fn reingesting_the_same_bytes_is_idempotent() -> TestResult {
    let f = fixture().await?;
    let first = f
        .pipeline
        .ingest(b"%PDF-1.7", PDF_MIME, source("manual.pdf", "manual"))
        .await?;
    let mut ids = f.backend.ids("documents").await;
    ids.sort();

    let second = f
        .pipeline
        .ingest(b"%PDF-1.7", PDF_MIME, source("manual.pdf", "manual"))
        .await?;
    let mut again = f.backend.ids("documents").await;
    again.sort();

    assert_eq!(first.chunk_count, second.chunk_count);
    assert_eq!(ids, again);
    Ok(())
}

#[tokio::test]
async fn document_scoping_excludes_other_documents() -> TestResult {
    let f = fixture().await?;
    for (id, text) in [
        ("A", "Pump A runs on diesel."),
        ("B", "Pump B runs on electricity."),
        ("C", "Pump C runs on steam."),
    ] {
        f.pipeline
            .ingest(text.as_bytes(), "text/plain", source(&format!("{id}.txt"), id))
            .await?;
    }

    let mut request = QueryRequest::new("what does the pump run on");
    request.retrieval.document_ids = vec!["A".to_string(), "B".to_string()];
    request.retrieval.top_k = Some(10);

    let QueryResponse::Retrieval(result) = f.pipeline.query(&request).await else {
        return Err("expected a retrieval response".into());
    };
    assert_eq!(result.documents.len(), 2);
    for scored in &result.documents {
        assert!(matches!(scored.segment.document_id(), Some("A" | "B")));
    }
    assert!(result.context.contains("[Source: A.txt]"));
    assert!(!result.context.contains("steam"));
    Ok(())
}

#[tokio::test]
async fn empty_context_skips_the_model() -> TestResult {
    let f = fixture().await?;
    let before = f.model.calls();

    let request = QueryRequest::new("no matching content").generating();
    let QueryResponse::Generation(result) = f.pipeline.query(&request).await else {
        return Err("expected a generation response".into());
    };

    assert_eq!(result.status, GenerationStatus::NoContext);
    assert_eq!(result.answer, NO_CONTEXT_ANSWER);
    assert_eq!(result.metrics.generation_time_seconds, Some(0.0));
    assert_eq!(f.model.calls(), before);
    assert!(f.records.query_log().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn generated_answers_are_logged() -> TestResult {
    let f = fixture().await?;
    f.pipeline
        .ingest(b"%PDF-1.7", PDF_MIME, source("manual.pdf", "manual"))
        .await?;

    let request = QueryRequest::new("when are seals replaced").generating();
    let QueryResponse::Generation(result) = f.pipeline.query(&request).await else {
        return Err("expected a generation response".into());
    };
    assert_eq!(result.status, GenerationStatus::Success);
    assert_eq!(result.answer, "The seals are replaced yearly.");

    let log = f.records.query_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].document_ids, vec!["manual".to_string()]);
    Ok(())
}

#[tokio::test]
async fn extraction_reads_fenced_json() -> TestResult {
    let f = fixture().await?;
    f.pipeline
        .ingest(b"Title: Hello", "text/plain", source("hello.txt", "doc"))
        .await?;
    f.model.set_reply("```json\n{\"title\": \"Hello\"}\n```");

    let result = f
        .pipeline
        .extract_structured(&ExtractionRequest {
            document_id: "doc".to_string(),
            schema: schema(json!({"title": "string"})),
            strategy: ExtractionStrategy::Auto,
            prompt_template: None,
        })
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(Value::Object(result.data), json!({"title": "Hello"}));
    assert_eq!(result.metadata["filename"], json!("hello.txt"));
    Ok(())
}

#[tokio::test]
async fn extraction_recovers_fields_from_prose() -> TestResult {
    let f = fixture().await?;
    f.pipeline
        .ingest(b"Title: Hello", "text/plain", source("hello.txt", "doc"))
        .await?;
    f.model
        .set_reply("Sure! The document's title: \"Hello\" appears on the first line.");

    let result = f
        .pipeline
        .extract_structured(&ExtractionRequest {
            document_id: "doc".to_string(),
            schema: schema(json!({"title": "string"})),
            strategy: ExtractionStrategy::Pattern,
            prompt_template: None,
        })
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(Value::Object(result.data), json!({"title": "Hello"}));
    assert_eq!(result.strategy, ExtractionStrategy::Pattern);
    Ok(())
}

#[tokio::test]
async fn unknown_documents_fail_without_panicking() -> TestResult {
    let f = fixture().await?;
    let result = f
        .pipeline
        .extract_structured(&ExtractionRequest {
            document_id: "missing".to_string(),
            schema: schema(json!({"title": "string"})),
            strategy: ExtractionStrategy::Auto,
            prompt_template: None,
        })
        .await;
    assert_eq!(result.status, ExtractionStatus::Error);
    assert_eq!(result.error.as_deref(), Some("Document not found"));

    let deleted = f.pipeline.delete_document("missing").await;
    assert!(matches!(deleted, Err(IngestError::DocumentNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn failed_reingest_leaves_the_document_searchable() -> TestResult {
    let f = fixture().await?;
    f.pipeline
        .ingest(b"Pump A runs on diesel.", "text/plain", source("a.txt", "A"))
        .await?;

    let failed = f
        .pipeline
        .ingest(b"not a docx", DOCX_MIME, source("a.docx", "A"))
        .await;
    assert!(failed.is_err());

    let record = f.records.get_document("A").await?.ok_or("record missing")?;
    assert!(record.is_indexed);
    assert_eq!(record.collection_name.as_deref(), Some("documents"));
    assert_eq!(record.filename.as_deref(), Some("a.txt"));
    assert!(record.processing_error.is_some());

    let mut request = QueryRequest::new("what does pump A run on");
    request.retrieval.document_ids = vec!["A".to_string()];
    let QueryResponse::Retrieval(result) = f.pipeline.query(&request).await else {
        return Err("expected a retrieval response".into());
    };
    assert_eq!(result.documents.len(), 1);

    f.pipeline.delete_document("A").await?;
    assert_eq!(f.backend.len("documents").await, 0);
    Ok(())
}
