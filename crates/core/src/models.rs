use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Metadata = BTreeMap<String, Value>;

pub const DOCUMENT_ID_KEY: &str = "document_id";
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// A contiguous span of extracted text plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub text: String,
    pub metadata: Metadata,
}

impl Segment {
    pub fn new(text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get(DOCUMENT_ID_KEY).and_then(Value::as_str)
    }

    /// Position of the segment inside its document. Web pages record it as `chunk`.
    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata
            .get(CHUNK_INDEX_KEY)
            .or_else(|| self.metadata.get("chunk"))
            .and_then(Value::as_u64)
    }
}

/// A segment together with the distance reported by the vector index.
/// Lower is more similar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals(Value),
    In(Vec<Value>),
}

impl FilterCondition {
    fn matches(&self, actual: Option<&Value>) -> bool {
        match (self, actual) {
            (FilterCondition::Equals(expected), Some(actual)) => expected == actual,
            (FilterCondition::In(allowed), Some(actual)) => allowed.contains(actual),
            (_, None) => false,
        }
    }
}

/// Conjunction of exact-match and set-membership constraints on segment metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataFilter {
    conditions: BTreeMap<String, FilterCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(key.into(), FilterCondition::Equals(value.into()));
        self
    }

    pub fn one_of<V: Into<Value>>(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.insert(
            key.into(),
            FilterCondition::In(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&String, &FilterCondition)> {
        self.conditions.iter()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions
            .iter()
            .all(|(key, condition)| condition.matches(metadata.get(key)))
    }

    /// Accepts `{"field": value}` and `{"field": {"$in": [..]}}` objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut filter = Self::new();
        for (key, condition) in object {
            let membership = condition
                .as_object()
                .and_then(|inner| inner.get("$in"))
                .and_then(Value::as_array);
            filter = match membership {
                Some(values) => filter.one_of(key.clone(), values.iter().cloned()),
                None => filter.equals(key.clone(), condition.clone()),
            };
        }
        Some(filter)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalRequest {
    pub query: String,
    pub collections: Vec<String>,
    pub filter: Option<MetadataFilter>,
    pub document_id: Option<String>,
    pub document_ids: Vec<String>,
    pub top_k: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// The request filter with document scoping merged in. A non-empty
    /// `document_ids` wins over `document_id`.
    pub fn scoped_filter(&self) -> Option<MetadataFilter> {
        let base = self.filter.clone().unwrap_or_default();
        let scoped = if !self.document_ids.is_empty() {
            base.one_of(DOCUMENT_ID_KEY, self.document_ids.iter().cloned())
        } else if let Some(document_id) = &self.document_id {
            base.equals(DOCUMENT_ID_KEY, document_id.clone())
        } else {
            base
        };

        if scoped.is_empty() {
            None
        } else {
            Some(scoped)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalMetrics {
    pub retrieval_time_seconds: f64,
    pub total_documents: usize,
    pub filtered_documents: usize,
    pub failed_collections: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub documents: Vec<ScoredSegment>,
    pub context: String,
    pub metrics: RetrievalMetrics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    NoContext,
    Error,
    Unavailable,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationMetrics {
    pub total_time_seconds: f64,
    pub retrieval_time_seconds: Option<f64>,
    pub generation_time_seconds: Option<f64>,
    pub total_documents: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub status: GenerationStatus,
    pub answer: String,
    pub context: String,
    pub documents: Vec<ScoredSegment>,
    pub metrics: GenerationMetrics,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    #[default]
    Auto,
    Template,
    Pattern,
}

impl FromStr for ExtractionStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "template" => Ok(Self::Template),
            "pattern" => Ok(Self::Pattern),
            other => Err(format!("unknown extraction strategy: {other}")),
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Template => "template",
            Self::Pattern => "pattern",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Error,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedField {
    pub name: String,
    pub value: Value,
    pub confidence: f32,
    pub source_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub document_id: String,
    pub schema: Map<String, Value>,
    #[serde(default)]
    pub strategy: ExtractionStrategy,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: String,
    pub data: Map<String, Value>,
    pub metadata: Metadata,
    pub fields: Vec<ExtractedField>,
    pub status: ExtractionStatus,
    pub error: Option<String>,
    pub extraction_time_ms: Option<u64>,
    pub strategy: ExtractionStrategy,
}

impl ExtractionResult {
    pub fn failed(
        document_id: impl Into<String>,
        strategy: ExtractionStrategy,
        metadata: Metadata,
        error: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            data: Map::new(),
            metadata,
            fields: Vec::new(),
            status: ExtractionStatus::Error,
            error: Some(error.into()),
            extraction_time_ms: None,
            strategy,
        }
    }
}

/// Caller-provided description of an ingested source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub filename: Option<String>,
    pub description: Option<String>,
    /// Fixes the document id so re-ingestion replaces instead of duplicating.
    pub document_id: Option<String>,
    pub source_path: Option<String>,
    #[serde(default)]
    pub extra: Metadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Indexed,
    /// Parsed without error but no text survived extraction.
    Empty,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub chunk_count: usize,
    pub collection: Option<String>,
    pub status: IngestStatus,
    pub message: Option<String>,
}

/// Rows returned by an external query, column-major names plus row values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TabularData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TabularData {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub query_text: String,
    pub query_type: String,
    pub parameters: Value,
    pub document_ids: Vec<String>,
    pub retrieval_time_ms: f64,
    pub generation_time_ms: f64,
    pub total_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(document_id: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(DOCUMENT_ID_KEY.to_string(), json!(document_id));
        metadata
    }

    #[test]
    fn plural_document_ids_win_over_single_id() {
        let request = RetrievalRequest {
            document_id: Some("C".to_string()),
            document_ids: vec!["A".to_string(), "B".to_string()],
            ..RetrievalRequest::new("pumps")
        };

        let filter = request.scoped_filter().expect("filter should be present");
        assert!(filter.matches(&metadata("A")));
        assert!(filter.matches(&metadata("B")));
        assert!(!filter.matches(&metadata("C")));
    }

    #[test]
    fn single_document_id_becomes_equality() {
        let request = RetrievalRequest {
            document_id: Some("C".to_string()),
            ..RetrievalRequest::new("pumps")
        };

        let filter = request.scoped_filter().expect("filter should be present");
        assert!(filter.matches(&metadata("C")));
        assert!(!filter.matches(&metadata("A")));
        assert!(!filter.matches(&Metadata::new()));
    }

    #[test]
    fn unscoped_request_has_no_filter() {
        assert!(RetrievalRequest::new("pumps").scoped_filter().is_none());
    }

    #[test]
    fn filter_parses_membership_operator() {
        let filter = MetadataFilter::from_json(&json!({
            "document_id": {"$in": ["A", "B"]},
            "format": "pdf",
        }))
        .expect("object should parse");

        let mut pdf_a = metadata("A");
        pdf_a.insert("format".to_string(), json!("pdf"));
        let mut csv_a = metadata("A");
        csv_a.insert("format".to_string(), json!("csv"));

        assert!(filter.matches(&pdf_a));
        assert!(!filter.matches(&csv_a));
    }

    #[test]
    fn chunk_index_falls_back_to_web_chunk_key() {
        let segment = Segment::new("text", Metadata::new()).with_entry("chunk", 3);
        assert_eq!(segment.chunk_index(), Some(3));
    }
}
