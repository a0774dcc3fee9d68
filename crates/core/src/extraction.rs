use crate::generation::Generator;
use crate::models::{
    ExtractedField, ExtractionRequest, ExtractionResult, ExtractionStatus, Metadata,
};
use crate::traits::RecordStore;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// No confidence model exists; every field gets this value.
pub const DEFAULT_CONFIDENCE: f32 = 1.0;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are an assistant that extracts structured information from documents.

Extract the following information from the text:
{schema_instructions}

Return one valid JSON object with exactly the keys listed above.
If a value cannot be determined, use null or an empty value of the appropriate type.
Do not include any explanation, only the JSON object.

Here is the text:
{document_text}";

/// Schema-driven field extraction from one stored document through a single
/// model call. `auto`, `template` and `pattern` all take this path.
pub struct StructuredExtractor {
    generator: Arc<Generator>,
    records: Arc<dyn RecordStore>,
}

impl StructuredExtractor {
    pub fn new(generator: Arc<Generator>, records: Arc<dyn RecordStore>) -> Self {
        Self { generator, records }
    }

    /// Failures come back as results with `status: error`.
    pub async fn extract(&self, request: &ExtractionRequest) -> ExtractionResult {
        let started = Instant::now();
        let document_id = request.document_id.as_str();
        let failed = |metadata: Metadata, error: String| {
            warn!(document_id, error = %error, "extraction failed");
            ExtractionResult::failed(document_id, request.strategy, metadata, error)
        };

        let document = match self.records.get_document(document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => return failed(Metadata::new(), "Document not found".to_string()),
            Err(err) => return failed(Metadata::new(), err.to_string()),
        };

        let mut metadata = Metadata::new();
        metadata.insert("filename".to_string(), json!(document.filename));
        metadata.insert("mime_type".to_string(), json!(document.mime_type));
        metadata.insert("doc_metadata".to_string(), json!(document.metadata));

        let segments = match self.records.segments(document_id).await {
            Ok(segments) if segments.is_empty() => {
                return failed(metadata, "No document segments found".to_string())
            }
            Ok(segments) => segments,
            Err(err) => return failed(metadata, err.to_string()),
        };
        let text = segments
            .iter()
            .map(|segment| segment.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = render_extraction_prompt(
            request.prompt_template.as_deref(),
            &render_schema(&request.schema),
            &text,
        );
        let raw = match self.generator.call_model(&prompt).await {
            Ok(raw) => raw,
            Err(err) => return failed(metadata, err.to_string()),
        };

        let data = parse_model_output(&raw, &request.schema);
        let fields = data
            .iter()
            .map(|(name, value)| ExtractedField {
                name: name.clone(),
                value: value.clone(),
                confidence: DEFAULT_CONFIDENCE,
                source_text: None,
            })
            .collect();

        let elapsed = started.elapsed().as_millis() as u64;
        info!(
            document_id,
            strategy = %request.strategy,
            fields = data.len(),
            elapsed_ms = elapsed,
            "extraction finished"
        );
        ExtractionResult {
            document_id: request.document_id.clone(),
            data,
            metadata,
            fields,
            status: ExtractionStatus::Success,
            error: None,
            extraction_time_ms: Some(elapsed),
            strategy: request.strategy,
        }
    }
}

fn describe_field(info: &Map<String, Value>) -> String {
    let kind = info.get("type").map(display).unwrap_or_default();
    let description = info.get("description").map(display).unwrap_or_default();
    format!("({kind}) {description}").trim_end().to_string()
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// One `- name: (type) description` line per field. Mappings without a
/// `type` are objects whose members are indented below them.
pub fn render_schema(schema: &Map<String, Value>) -> String {
    let mut lines = Vec::new();
    for (name, info) in schema {
        match info {
            Value::Object(inner) if inner.contains_key("type") => {
                lines.push(format!("- {name}: {}", describe_field(inner)));
            }
            Value::Object(inner) => {
                lines.push(format!("- {name}: (object) containing:"));
                for (member, member_info) in inner {
                    let rendered = match member_info {
                        Value::Object(nested) if nested.contains_key("type") => {
                            describe_field(nested)
                        }
                        other => display(other),
                    };
                    lines.push(format!("  - {member}: {rendered}"));
                }
            }
            other => lines.push(format!("- {name}: ({})", display(other))),
        }
    }
    lines.join("\n")
}

pub fn render_extraction_prompt(template: Option<&str>, schema: &str, text: &str) -> String {
    template
        .filter(|template| !template.trim().is_empty())
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE)
        .replace("{schema_instructions}", schema)
        .replace("{document_text}", text)
}

/// Removes a leading Markdown code fence and everything after its closing fence.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    rest.split("```").next().unwrap_or(rest).trim()
}

/// Parses the reply as a JSON object, or recovers what it can with
/// [`scan_fields`]. Never fails.
pub fn parse_model_output(raw: &str, schema: &Map<String, Value>) -> Map<String, Value> {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(data)) => data,
        Ok(_) | Err(_) => {
            warn!(
                response_chars = raw.chars().count(),
                "model reply is not a JSON object, scanning for fields"
            );
            scan_fields(body, schema)
        }
    }
}

/// Finds `"key": "value"`, `'key': 'value'` or `key: "value"` for each schema
/// key. Keys without a quoted value are left out.
pub fn scan_fields(text: &str, schema: &Map<String, Value>) -> Map<String, Value> {
    let mut data = Map::new();
    for key in schema.keys() {
        let escaped = regex::escape(key);
        let pattern = format!(
            r#"(?:"{escaped}"|'{escaped}'|\b{escaped}\b)\s*[:=]\s*(?:"([^"]*)"|'([^']*)')"#
        );
        let Ok(matcher) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(captures) = matcher.captures(text) {
            if let Some(value) = captures.get(1).or_else(|| captures.get(2)) {
                data.insert(key.clone(), json!(value.as_str()));
            }
        }
    }
    data
}
