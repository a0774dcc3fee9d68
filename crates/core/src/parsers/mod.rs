//! Per-format text extraction and the MIME dispatcher in front of it.
//!
//! A parser turns bytes into raw units (pages, a document body, table views,
//! OCR text). The registry strips NUL bytes, drops empty units and hands the
//! rest to the chunker.

pub mod docx;
pub mod image;
pub mod ocr;
pub mod pdf;
pub mod tabular;
pub mod text;
pub mod web;

pub use self::docx::DocxParser;
pub use self::image::ImageParser;
pub use self::ocr::{HttpOcrEngine, OcrEngine, PageText};
pub use self::pdf::{LopdfExtractor, PdfContent, PdfExtractor, PdfParser};
pub use self::tabular::{render_table, table_views, TabularParser};
pub use self::text::TextParser;
pub use self::web::{WebFetcher, WebParser};

use crate::chunking::Chunker;
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const PDF_MIME: &str = "application/pdf";
pub const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const CSV_MIME: &str = "text/csv";
pub const JSON_MIME: &str = "application/json";
pub const HTML_MIME: &str = "text/html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    PortableDocument,
    WordProcessor,
    Text,
    Tabular,
    Image,
    Web,
}

impl ParserKind {
    /// Exact matches first, then the `text/` and `image/` families.
    pub fn for_mime(mime_type: &str) -> Option<Self> {
        let mime = essence(mime_type);
        let exact = match mime.as_str() {
            PDF_MIME => Some(Self::PortableDocument),
            DOCX_MIME => Some(Self::WordProcessor),
            HTML_MIME | "application/xhtml+xml" | "application/web" => Some(Self::Web),
            CSV_MIME | JSON_MIME | XLSX_MIME => Some(Self::Tabular),
            _ => None,
        };
        exact.or_else(|| {
            if mime.starts_with("text/") {
                Some(Self::Text)
            } else if mime.starts_with("image/") {
                Some(Self::Image)
            } else {
                None
            }
        })
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PortableDocument => "portable_document",
            Self::WordProcessor => "word_processor",
            Self::Text => "text",
            Self::Tabular => "tabular",
            Self::Image => "image",
            Self::Web => "web",
        };
        f.write_str(name)
    }
}

/// Lower-cased MIME type without parameters.
pub fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[async_trait]
pub trait FormatParser: Send + Sync {
    fn kind(&self) -> ParserKind;

    /// Raw text units carrying `metadata` plus format-specific entries.
    async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError>;
}

pub fn clean_text(text: &str) -> String {
    text.replace('\0', "")
}

fn clean_segments(segments: Vec<Segment>) -> Vec<Segment> {
    segments
        .into_iter()
        .filter_map(|mut segment| {
            if segment.text.contains('\0') {
                segment.text = clean_text(&segment.text);
            }
            (!segment.text.trim().is_empty()).then_some(segment)
        })
        .collect()
}

pub struct ParserRegistry {
    parsers: HashMap<ParserKind, Arc<dyn FormatParser>>,
    chunker: Chunker,
}

impl ParserRegistry {
    pub fn new(chunker: Chunker) -> Self {
        Self {
            parsers: HashMap::new(),
            chunker,
        }
    }

    /// All built-in parsers. Images and text-less PDFs need an OCR engine to
    /// yield anything.
    pub fn with_defaults(chunker: Chunker, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self::new(chunker)
            .register(Arc::new(PdfParser::new(
                Arc::new(LopdfExtractor),
                ocr.clone(),
            )))
            .register(Arc::new(DocxParser))
            .register(Arc::new(TextParser))
            .register(Arc::new(TabularParser))
            .register(Arc::new(ImageParser::new(ocr)))
            .register(Arc::new(WebParser))
    }

    pub fn register(mut self, parser: Arc<dyn FormatParser>) -> Self {
        self.parsers.insert(parser.kind(), parser);
        self
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn resolve(&self, mime_type: &str) -> Result<Arc<dyn FormatParser>, IngestError> {
        ParserKind::for_mime(mime_type)
            .and_then(|kind| self.parsers.get(&kind))
            .cloned()
            .ok_or_else(|| {
                warn!(mime_type, "no parser available");
                IngestError::UnsupportedMimeType(mime_type.to_string())
            })
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        ParserKind::for_mime(mime_type).is_some_and(|kind| self.parsers.contains_key(&kind))
    }

    /// Extracts and chunks. Web pages additionally get `chunk`/`total_chunks`.
    pub async fn parse(
        &self,
        mime_type: &str,
        bytes: &[u8],
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let parser = self.resolve(mime_type)?;
        let units = clean_segments(parser.extract(bytes, mime_type, metadata).await?);
        let mut segments = clean_segments(self.chunker.split_segments(&units).await);

        if parser.kind() == ParserKind::Web {
            let total = segments.len();
            for (index, segment) in segments.iter_mut().enumerate() {
                segment.metadata.insert("chunk".to_string(), json!(index));
                segment.metadata.insert("total_chunks".to_string(), json!(total));
            }
        }

        debug!(
            parser = %parser.kind(),
            units = units.len(),
            segments = segments.len(),
            "parsed"
        );
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;

    #[test]
    fn dispatch_prefers_exact_matches() {
        assert_eq!(ParserKind::for_mime("text/html"), Some(ParserKind::Web));
        assert_eq!(ParserKind::for_mime("text/csv"), Some(ParserKind::Tabular));
        assert_eq!(ParserKind::for_mime("Application/JSON"), Some(ParserKind::Tabular));
        assert_eq!(
            ParserKind::for_mime("text/markdown; charset=utf-8"),
            Some(ParserKind::Text)
        );
        assert_eq!(ParserKind::for_mime("image/webp"), Some(ParserKind::Image));
        assert_eq!(ParserKind::for_mime(PDF_MIME), Some(ParserKind::PortableDocument));
        assert_eq!(ParserKind::for_mime(DOCX_MIME), Some(ParserKind::WordProcessor));
        assert_eq!(ParserKind::for_mime("application/zip"), None);
    }

    #[tokio::test]
    async fn unsupported_mime_is_a_typed_error() -> Result<(), IngestError> {
        let registry = ParserRegistry::with_defaults(Chunker::new(ChunkingConfig::default())?, None);
        let result = registry.parse("application/zip", b"PK", &Metadata::new()).await;
        assert!(matches!(
            result,
            Err(IngestError::UnsupportedMimeType(mime)) if mime == "application/zip"
        ));
        assert!(!registry.supports("video/mp4"));
        Ok(())
    }

    #[tokio::test]
    async fn nul_bytes_are_stripped_and_blank_text_dropped() -> Result<(), IngestError> {
        let registry = ParserRegistry::with_defaults(Chunker::new(ChunkingConfig::default())?, None);
        let segments = registry
            .parse("text/plain", b"Hello\0 world", &Metadata::new())
            .await?;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Hello world");

        let blank = registry.parse("text/plain", b"\0 \n\0", &Metadata::new()).await?;
        assert!(blank.is_empty());
        Ok(())
    }
}
