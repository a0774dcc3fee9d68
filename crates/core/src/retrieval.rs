use crate::models::{
    RetrievalMetrics, RetrievalRequest, RetrievalResult, ScoredSegment, Segment,
};
use crate::store::VectorStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Searches several collections, keeps the global top-k by distance and
/// renders the survivors into a source-grouped context block.
pub struct Retriever {
    store: Arc<VectorStore>,
    default_collections: Vec<String>,
    default_top_k: usize,
}

impl Retriever {
    pub fn new(store: Arc<VectorStore>, default_collections: Vec<String>, default_top_k: usize) -> Self {
        Self {
            store,
            default_collections,
            default_top_k,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Never fails: a collection whose search errors is logged, reported in
    /// the metrics and skipped.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult {
        let started = Instant::now();
        let collections = if request.collections.is_empty() {
            &self.default_collections
        } else {
            &request.collections
        };
        let filter = request.scoped_filter();
        let top_k = request.top_k.unwrap_or(self.default_top_k);

        let mut candidates: Vec<ScoredSegment> = Vec::new();
        let mut failed_collections = Vec::new();
        for collection in collections {
            match self
                .store
                .search_with_score(&request.query, collection, filter.as_ref(), top_k)
                .await
            {
                Ok(hits) => {
                    debug!(collection = %collection, hits = hits.len(), "collection searched");
                    candidates.extend(hits);
                }
                Err(err) => {
                    error!(collection = %collection, error = %err, "collection search failed");
                    failed_collections.push(collection.clone());
                }
            }
        }

        let total = candidates.len();
        candidates.sort_by(|left, right| left.score.total_cmp(&right.score));
        candidates.truncate(top_k);

        let context = build_context(&candidates);
        let kept = candidates.len();
        RetrievalResult {
            documents: candidates,
            context,
            metrics: RetrievalMetrics {
                retrieval_time_seconds: started.elapsed().as_secs_f64(),
                total_documents: kept,
                filtered_documents: total - kept,
                failed_collections,
            },
        }
    }
}

fn non_empty<'a>(segment: &'a Segment, key: &str) -> Option<&'a str> {
    segment
        .metadata
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Label used in `[Source: ...]` headers: filename, URL without its query
/// string, title, `source`, or `Document <id>`.
pub fn source_id(segment: &Segment) -> String {
    if let Some(filename) = non_empty(segment, "filename") {
        return filename.to_string();
    }
    if let Some(url) = non_empty(segment, "url") {
        let bare = url.split('?').next().unwrap_or(url);
        return bare.trim_end_matches('/').to_string();
    }
    if let Some(label) = non_empty(segment, "title").or_else(|| non_empty(segment, "source")) {
        return label.to_string();
    }
    format!("Document {}", segment.document_id().unwrap_or("unknown"))
}

/// One block per source in first-seen order, segments ordered by chunk index.
pub fn build_context(documents: &[ScoredSegment]) -> String {
    let mut groups: Vec<(String, Vec<&Segment>)> = Vec::new();
    for scored in documents {
        let source = source_id(&scored.segment);
        match groups.iter_mut().find(|(existing, _)| *existing == source) {
            Some((_, members)) => members.push(&scored.segment),
            None => groups.push((source, vec![&scored.segment])),
        }
    }

    groups
        .into_iter()
        .map(|(source, mut members)| {
            members.sort_by_key(|segment| segment.chunk_index().unwrap_or(u64::MAX));
            let texts: Vec<&str> = members.iter().map(|segment| segment.text.as_str()).collect();
            format!("[Source: {source}]\n{}", texts.join("\n\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string()
}
