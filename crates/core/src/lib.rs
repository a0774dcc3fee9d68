pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extraction;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod openai;
pub mod parsers;
pub mod pipeline;
pub mod records;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{Chunker, ChunkingConfig, ChunkingStrategy};
pub use config::Settings;
pub use embeddings::{build_embedder, CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ConfigError, IngestError, PipelineError, ProviderError, StoreError};
pub use extraction::StructuredExtractor;
pub use generation::{Generator, GeneratorState, ProviderSlot};
pub use ingest::{discover_files, mime_for_path, FolderReport, IngestedFile, Ingestor, SkippedFile};
pub use models::{
    ExtractionRequest, ExtractionResult, ExtractionStatus, ExtractionStrategy, GenerationResult,
    GenerationStatus, IngestReceipt, IngestStatus, Metadata, MetadataFilter, RetrievalRequest,
    RetrievalResult, ScoredSegment, Segment, SourceMetadata, TabularData,
};
pub use parsers::{FormatParser, ParserKind, ParserRegistry};
pub use pipeline::{QueryRequest, QueryResponse, RagPipeline};
pub use records::{DocumentRecord, FsObjectStore, InMemoryRecordStore, JsonRecordStore, SegmentRecord};
pub use retrieval::Retriever;
pub use store::VectorStore;
pub use stores::{InMemoryStore, QdrantStore};
pub use traits::{LanguageModel, ObjectStore, RecordStore, VectorBackend};
