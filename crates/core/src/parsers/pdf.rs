use super::ocr::{OcrEngine, PageText};
use super::{FormatParser, ParserKind, PDF_MIME};
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use lopdf::{Dictionary, Document, Object};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const INFO_FIELDS: [(&[u8], &str); 4] = [
    (b"Title", "title"),
    (b"Author", "author"),
    (b"Subject", "subject"),
    (b"Keywords", "keywords"),
];

/// Text layer of a PDF. `pages` only holds pages with readable text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfContent {
    pub page_count: usize,
    pub info: BTreeMap<String, String>,
    pub pages: Vec<PageText>,
}

pub trait PdfExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<PdfContent, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<PdfContent, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let page_numbers = document.get_pages();
        let mut pages = Vec::new();
        for page_no in page_numbers.keys().copied() {
            let text = match document.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(page = page_no, error = %error, "page text not extractable");
                    continue;
                }
            };
            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        Ok(PdfContent {
            page_count: page_numbers.len(),
            info: info_dictionary(&document)
                .map(read_info)
                .unwrap_or_default(),
            pages,
        })
    }
}

fn info_dictionary(document: &Document) -> Option<&Dictionary> {
    match document.trailer.get(b"Info").ok()? {
        Object::Reference(id) => document.get_dictionary(*id).ok(),
        Object::Dictionary(dictionary) => Some(dictionary),
        _ => None,
    }
}

fn read_info(dictionary: &Dictionary) -> BTreeMap<String, String> {
    INFO_FIELDS
        .iter()
        .filter_map(|(key, name)| match dictionary.get(key).ok()? {
            Object::String(bytes, _) => {
                let value = decode_text_string(bytes);
                let value = value.trim();
                (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
            }
            _ => None,
        })
        .collect()
}

/// PDF text strings are UTF-16BE with a byte order mark, or a single-byte encoding.
fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|byte| char::from(*byte)).collect(),
    }
}

/// One unit per page with text. Falls back to OCR when the document has no
/// text layer at all.
pub struct PdfParser {
    extractor: Arc<dyn PdfExtractor>,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl PdfParser {
    pub fn new(extractor: Arc<dyn PdfExtractor>, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { extractor, ocr }
    }

    async fn ocr_pages(&self, bytes: &[u8], source: &str) -> Result<Vec<PageText>, IngestError> {
        let Some(ocr) = &self.ocr else {
            warn!(source, "pdf has no text layer and no OCR engine is configured");
            return Ok(Vec::new());
        };
        info!(source, "pdf has no text layer, running OCR");
        ocr.recognize(bytes, PDF_MIME, source)
            .await
            .map_err(|error| IngestError::PdfParse(format!("no readable page text; OCR fallback failed: {error}")))
    }
}

#[async_trait]
impl FormatParser for PdfParser {
    fn kind(&self) -> ParserKind {
        ParserKind::PortableDocument
    }

    async fn extract(
        &self,
        bytes: &[u8],
        _mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let extractor = Arc::clone(&self.extractor);
        let owned = bytes.to_vec();
        let mut content = tokio::task::spawn_blocking(move || extractor.extract(&owned))
            .await
            .map_err(|error| IngestError::PdfParse(error.to_string()))??;

        let mut ocr = false;
        if content.pages.is_empty() {
            let source = metadata
                .get("filename")
                .and_then(|value| value.as_str())
                .unwrap_or("document.pdf")
                .to_string();
            content.pages = self.ocr_pages(bytes, &source).await?;
            ocr = !content.pages.is_empty();
        }

        let mut base = metadata.clone();
        base.insert("format".to_string(), json!("pdf"));
        base.insert("page_count".to_string(), json!(content.page_count));
        for (key, value) in &content.info {
            base.insert(key.clone(), json!(value));
        }
        if ocr {
            base.insert("ocr".to_string(), json!(true));
        }

        Ok(content
            .pages
            .into_iter()
            .map(|page| Segment::new(page.text, base.clone()).with_entry("page", page.number))
            .collect())
    }
}
