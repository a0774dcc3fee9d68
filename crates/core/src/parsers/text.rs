use super::{essence, FormatParser, ParserKind};
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use serde_json::json;

/// `text/*` content decoded as UTF-8, invalid sequences replaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParser;

fn is_markdown(mime_type: &str, metadata: &Metadata) -> bool {
    let mime = essence(mime_type);
    if mime == "text/markdown" || mime == "text/x-markdown" {
        return true;
    }
    metadata
        .get("filename")
        .and_then(|value| value.as_str())
        .is_some_and(|name| {
            let name = name.to_ascii_lowercase();
            name.ends_with(".md") || name.ends_with(".markdown")
        })
}

#[async_trait]
impl FormatParser for TextParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Text
    }

    async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let format = if is_markdown(mime_type, metadata) {
            "markdown"
        } else {
            "text"
        };
        let mut metadata = metadata.clone();
        metadata.insert("format".to_string(), json!(format));
        Ok(vec![Segment::new(text, metadata)])
    }
}
