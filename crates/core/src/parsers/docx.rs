use super::{FormatParser, ParserKind};
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const BODY_PART: &str = "word/document.xml";
const CORE_PROPERTIES_PART: &str = "docProps/core.xml";

/// Word processing documents. Non-empty paragraphs become one unit joined by
/// blank lines; core properties are copied into the metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxParser;

#[async_trait]
impl FormatParser for DocxParser {
    fn kind(&self) -> ParserKind {
        ParserKind::WordProcessor
    }

    async fn extract(
        &self,
        bytes: &[u8],
        _mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|error| IngestError::DocxParse(error.to_string()))?;

        let body = read_part(&mut archive, BODY_PART)?
            .ok_or_else(|| IngestError::DocxParse(format!("missing {BODY_PART}")))?;
        let paragraphs = paragraphs(&body)?;

        let mut metadata = metadata.clone();
        metadata.insert("format".to_string(), json!("docx"));
        metadata.insert("paragraph_count".to_string(), json!(paragraphs.len()));
        if let Some(core) = read_part(&mut archive, CORE_PROPERTIES_PART)? {
            for (key, value) in core_properties(&core)? {
                metadata.insert(key, json!(value));
            }
        }

        if paragraphs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Segment::new(paragraphs.join("\n\n"), metadata)])
    }
}

fn read_part(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, IngestError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(IngestError::DocxParse(error.to_string())),
    };
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(Some(content))
}

/// Trimmed, non-empty `w:p` paragraphs. `w:tab` and `w:br` keep their spacing.
fn paragraphs(xml: &str) -> Result<Vec<String>, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"p" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(text)) if in_text => {
                let text = text
                    .unescape()
                    .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::DocxParse(error.to_string())),
            _ => {}
        }
    }

    Ok(paragraphs)
}

fn core_properties(xml: &str) -> Result<BTreeMap<String, String>, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut properties = BTreeMap::new();
    let mut current: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                current = match element.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("author"),
                    b"subject" => Some("subject"),
                    b"keywords" => Some("keywords"),
                    _ => None,
                };
            }
            Ok(Event::Text(text)) => {
                if let Some(key) = current {
                    let value = text
                        .unescape()
                        .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                    let value = value.trim();
                    if !value.is_empty() {
                        properties.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::DocxParse(error.to_string())),
            _ => {}
        }
    }

    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn docx(parts: &[(&str, &str)]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in parts {
            writer.start_file(*name, SimpleFileOptions::default())?;
            writer.write_all(content.as_bytes())?;
        }
        Ok(writer.finish()?.into_inner())
    }

    const BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Safety</w:t></w:r><w:r><w:t xml:space="preserve"> first &amp; always</w:t></w:r></w:p>
    <w:p><w:r><w:t>   </w:t></w:r></w:p>
    <w:p><w:r><w:t>Step</w:t><w:tab/><w:t>one</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    const CORE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <dc:title>Operator handbook</dc:title>
  <dc:creator>Plant team</dc:creator>
  <cp:keywords>safety, pumps</cp:keywords>
</cp:coreProperties>"#;

    #[tokio::test]
    async fn paragraphs_and_core_properties() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = docx(&[(BODY_PART, BODY), (CORE_PROPERTIES_PART, CORE)])?;
        let segments = DocxParser.extract(&bytes, "", &Metadata::new()).await?;

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Safety first & always\n\nStep\tone");
        let metadata = &segments[0].metadata;
        assert_eq!(metadata["format"], json!("docx"));
        assert_eq!(metadata["paragraph_count"], json!(2));
        assert_eq!(metadata["title"], json!("Operator handbook"));
        assert_eq!(metadata["author"], json!("Plant team"));
        assert_eq!(metadata["keywords"], json!("safety, pumps"));
        assert!(!metadata.contains_key("subject"));
        Ok(())
    }

    #[tokio::test]
    async fn archives_without_a_body_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = docx(&[(CORE_PROPERTIES_PART, CORE)])?;
        let result = DocxParser.extract(&bytes, "", &Metadata::new()).await;
        assert!(matches!(result, Err(IngestError::DocxParse(_))));

        let result = DocxParser.extract(b"plain text", "", &Metadata::new()).await;
        assert!(matches!(result, Err(IngestError::DocxParse(_))));
        Ok(())
    }
}
