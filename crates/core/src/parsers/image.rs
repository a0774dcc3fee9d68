use super::ocr::OcrEngine;
use super::{essence, FormatParser, ParserKind};
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use image::{ColorType, ImageReader};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub mode: String,
}

fn color_mode(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "unknown",
    }
}

pub fn inspect(bytes: &[u8]) -> Result<ImageInfo, IngestError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|error| IngestError::Image(error.to_string()))?;
    let format = reader
        .format()
        .map(|format| format!("{format:?}").to_ascii_uppercase())
        .ok_or_else(|| IngestError::Image("unrecognised image format".to_string()))?;
    let decoded = reader
        .decode()
        .map_err(|error| IngestError::Image(error.to_string()))?;

    Ok(ImageInfo {
        width: decoded.width(),
        height: decoded.height(),
        format,
        mode: color_mode(decoded.color()).to_string(),
    })
}

/// Images yield OCR text only; without an engine or text nothing is indexed.
pub struct ImageParser {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl ImageParser {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }
}

#[async_trait]
impl FormatParser for ImageParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Image
    }

    async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let owned = bytes.to_vec();
        let info = tokio::task::spawn_blocking(move || inspect(&owned))
            .await
            .map_err(|error| IngestError::Image(error.to_string()))??;

        let Some(ocr) = &self.ocr else {
            warn!(mime_type, "no OCR engine configured, image has no text");
            return Ok(Vec::new());
        };

        let source = metadata
            .get("filename")
            .and_then(|value| value.as_str())
            .unwrap_or("image");
        let pages = match ocr.recognize(bytes, &essence(mime_type), source).await {
            Ok(pages) => pages,
            Err(IngestError::OcrFailed(reason)) => {
                warn!(source, reason = %reason, "no text recognised in image");
                return Ok(Vec::new());
            }
            Err(error) => return Err(error),
        };

        let text = pages
            .into_iter()
            .map(|page| page.text)
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut metadata = metadata.clone();
        metadata.insert("width".to_string(), json!(info.width));
        metadata.insert("height".to_string(), json!(info.height));
        metadata.insert("format".to_string(), json!(info.format));
        metadata.insert("mode".to_string(), json!(info.mode));
        Ok(vec![Segment::new(text, metadata)])
    }
}
