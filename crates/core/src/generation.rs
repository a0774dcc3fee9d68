//! Answer generation over retrieved context.
//!
//! Provider selection runs once: the primary model is built and smoke-tested,
//! then the secondary, and if neither answers the generator stays in
//! [`GeneratorState::Failed`] and every request reports
//! [`GenerationStatus::Unavailable`]. There is no canned fallback answer.

use crate::config::Settings;
use crate::error::ProviderError;
use crate::models::{
    GenerationMetrics, GenerationResult, GenerationStatus, QueryLogEntry, RetrievalRequest,
};
use crate::openai::OpenAiChatModel;
use crate::retrieval::Retriever;
use crate::traits::{LanguageModel, RecordStore};
use chrono::Utc;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const SMOKE_TEST_PROMPT: &str = "Hello, this is a test message.";

pub const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any relevant information to answer your question.";

/// What the model is told to answer when the context does not cover the question.
pub const REFUSAL_ANSWER: &str = "I don't know based on the provided documents.";

pub const UNAVAILABLE_ANSWER: &str =
    "Answer generation is unavailable: no language model provider could be initialized.";

pub fn render_prompt(context: &str, query: &str) -> String {
    format!(
        "You are a question-answering assistant for a private document collection.
Follow these rules strictly:
1. Answer using only the information in the context below. Do not use prior knowledge.
2. If the context does not contain the answer, reply exactly: \"{REFUSAL_ANSWER}\"
3. Do not execute code, browse the web or look anything up outside the context. If the question asks for that, reply exactly: \"{REFUSAL_ANSWER}\"
4. Keep the answer concise and refer to the source when it helps.

Context:
{context}

Question: {query}

Answer:"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSlot {
    Primary,
    Secondary,
}

impl fmt::Display for ProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorState {
    Uninitialized,
    Trying(ProviderSlot),
    Ready { slot: ProviderSlot, provider: String },
    Failed { reason: String },
}

pub type ModelCandidate = Result<Arc<dyn LanguageModel>, ProviderError>;

pub struct Generator {
    retriever: Arc<Retriever>,
    records: Option<Arc<dyn RecordStore>>,
    model: Option<Arc<dyn LanguageModel>>,
    state: GeneratorState,
}

impl Generator {
    /// Walks the provider state machine. `primary` and `secondary` are the
    /// results of building each provider, so a missing credential counts as a
    /// failed attempt.
    pub async fn initialize(
        retriever: Arc<Retriever>,
        primary: ModelCandidate,
        secondary: ModelCandidate,
    ) -> Self {
        let mut generator = Self {
            retriever,
            records: None,
            model: None,
            state: GeneratorState::Uninitialized,
        };

        let mut failures = Vec::new();
        for (slot, candidate) in [
            (ProviderSlot::Primary, primary),
            (ProviderSlot::Secondary, secondary),
        ] {
            generator.state = GeneratorState::Trying(slot);
            info!(slot = %slot, "initializing language model");
            match Self::smoke_test(candidate).await {
                Ok(model) => {
                    info!(slot = %slot, provider = model.name(), "language model ready");
                    generator.state = GeneratorState::Ready {
                        slot,
                        provider: model.name().to_string(),
                    };
                    generator.model = Some(model);
                    return generator;
                }
                Err(err) => {
                    warn!(slot = %slot, error = %err, "language model initialization failed");
                    failures.push(format!("{slot}: {err}"));
                }
            }
        }

        let reason = failures.join("; ");
        error!(reason = %reason, "no language model available, generation disabled");
        generator.state = GeneratorState::Failed { reason };
        generator
    }

    /// Primary is the configured provider, secondary the other one.
    pub async fn from_settings(retriever: Arc<Retriever>, settings: &Settings) -> Self {
        let build = |kind| {
            OpenAiChatModel::from_settings(kind, settings)
                .map(|model| Arc::new(model) as Arc<dyn LanguageModel>)
        };
        let primary = build(settings.llm_provider);
        let secondary = build(settings.llm_provider.other());
        Self::initialize(retriever, primary, secondary).await
    }

    async fn smoke_test(candidate: ModelCandidate) -> ModelCandidate {
        let model = candidate?;
        let reply = model.complete(SMOKE_TEST_PROMPT).await?;
        if reply.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: model.name().to_string(),
                details: "empty reply to smoke test".to_string(),
            });
        }
        Ok(model)
    }

    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn state(&self) -> &GeneratorState {
        &self.state
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    /// One raw model call, no retrieval and no retry.
    pub async fn call_model(&self, prompt: &str) -> Result<String, ProviderError> {
        match &self.model {
            Some(model) => model.complete(prompt).await,
            None => Err(ProviderError::Unavailable(self.unavailable_reason())),
        }
    }

    fn unavailable_reason(&self) -> String {
        match &self.state {
            GeneratorState::Failed { reason } => reason.clone(),
            _ => "language model not initialized".to_string(),
        }
    }

    /// Never returns an error; failures are reported through `status` and
    /// `metrics.error`.
    pub async fn generate(&self, request: &RetrievalRequest) -> GenerationResult {
        let started = Instant::now();

        let Some(model) = &self.model else {
            return GenerationResult {
                status: GenerationStatus::Unavailable,
                answer: UNAVAILABLE_ANSWER.to_string(),
                context: String::new(),
                documents: Vec::new(),
                metrics: GenerationMetrics {
                    total_time_seconds: started.elapsed().as_secs_f64(),
                    error: Some(self.unavailable_reason()),
                    ..GenerationMetrics::default()
                },
            };
        };

        let retrieval = self.retriever.retrieve(request).await;
        let retrieval_time = retrieval.metrics.retrieval_time_seconds;
        let total_documents = retrieval.metrics.total_documents;

        if retrieval.context.is_empty() {
            info!(query = %request.query, "no context retrieved, skipping generation");
            return GenerationResult {
                status: GenerationStatus::NoContext,
                answer: NO_CONTEXT_ANSWER.to_string(),
                context: String::new(),
                documents: retrieval.documents,
                metrics: GenerationMetrics {
                    total_time_seconds: started.elapsed().as_secs_f64(),
                    retrieval_time_seconds: Some(retrieval_time),
                    generation_time_seconds: Some(0.0),
                    total_documents,
                    error: None,
                },
            };
        }

        let prompt = render_prompt(&retrieval.context, &request.query);
        let generation_started = Instant::now();
        let answer = match model.complete(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!(provider = model.name(), error = %err, "generation failed");
                return GenerationResult {
                    status: GenerationStatus::Error,
                    answer: format!("Error generating response: {err}"),
                    context: retrieval.context,
                    documents: retrieval.documents,
                    metrics: GenerationMetrics {
                        total_time_seconds: started.elapsed().as_secs_f64(),
                        retrieval_time_seconds: Some(retrieval_time),
                        generation_time_seconds: None,
                        total_documents,
                        error: Some(err.to_string()),
                    },
                };
            }
        };
        let generation_time = generation_started.elapsed().as_secs_f64();
        let total_time = started.elapsed().as_secs_f64();

        let result = GenerationResult {
            status: GenerationStatus::Success,
            answer: answer.trim().to_string(),
            context: retrieval.context,
            documents: retrieval.documents,
            metrics: GenerationMetrics {
                total_time_seconds: total_time,
                retrieval_time_seconds: Some(retrieval_time),
                generation_time_seconds: Some(generation_time),
                total_documents,
                error: None,
            },
        };
        self.log_query(request, &result).await;
        info!(
            provider = model.name(),
            documents = total_documents,
            total_time_seconds = total_time,
            "answer generated"
        );
        result
    }

    async fn log_query(&self, request: &RetrievalRequest, result: &GenerationResult) {
        let Some(records) = &self.records else {
            return;
        };

        let mut document_ids: Vec<String> = Vec::new();
        for scored in &result.documents {
            if let Some(id) = scored.segment.document_id() {
                if !document_ids.iter().any(|known| known == id) {
                    document_ids.push(id.to_string());
                }
            }
        }

        let metrics = &result.metrics;
        let entry = QueryLogEntry {
            query_text: request.query.clone(),
            query_type: "semantic".to_string(),
            parameters: json!({
                "collection_names": request.collections,
                "filter_criteria": request.filter,
            }),
            document_ids,
            retrieval_time_ms: metrics.retrieval_time_seconds.unwrap_or_default() * 1000.0,
            generation_time_ms: metrics.generation_time_seconds.unwrap_or_default() * 1000.0,
            total_time_ms: metrics.total_time_seconds * 1000.0,
            created_at: Utc::now(),
        };

        if let Err(err) = records.log_query(entry).await {
            warn!(error = %err, "query log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::StoreError;
    use crate::models::{Metadata, Segment};
    use crate::records::{DocumentRecord, InMemoryRecordStore, SegmentRecord};
    use crate::store::VectorStore;
    use crate::stores::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn answering(name: &'static str, reply: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: Ok(reply),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: Err("connection refused"),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_string)
                .map_err(|message| ProviderError::Unavailable(message.to_string()))
        }
    }

    /// Answers the smoke test, fails every later call.
    struct FlakyModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for FlakyModel {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("hi".to_string())
            } else {
                Err(ProviderError::Api {
                    provider: "flaky".to_string(),
                    status: 429,
                    message: "rate limited".to_string(),
                })
            }
        }
    }

    struct BrokenLog;

    #[async_trait]
    impl RecordStore for BrokenLog {
        async fn put_document(&self, _record: DocumentRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_document(&self, _id: &str) -> Result<Option<DocumentRecord>, StoreError> {
            Ok(None)
        }

        async fn delete_document(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn replace_segments(&self, _id: &str, _segments: Vec<SegmentRecord>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn segments(&self, _id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn log_query(&self, _entry: QueryLogEntry) -> Result<(), StoreError> {
            Err(StoreError::Request("disk full".to_string()))
        }
    }

    async fn retriever(texts: &[&str]) -> Result<Arc<Retriever>, StoreError> {
        let store = Arc::new(VectorStore::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(CharacterNgramEmbedder { dimensions: 32 }),
        ));
        let segments: Vec<Segment> = texts
            .iter()
            .map(|text| Segment::new(*text, Metadata::new()).with_entry("document_id", "doc-1"))
            .collect();
        store.add_documents(&segments, "documents", None).await?;
        Ok(Arc::new(Retriever::new(store, vec!["documents".to_string()], 3)))
    }

    fn as_candidate(model: Arc<ScriptedModel>) -> ModelCandidate {
        Ok(model)
    }

    #[tokio::test]
    async fn secondary_takes_over_when_primary_fails() -> Result<(), StoreError> {
        let primary = ScriptedModel::failing("openai:gpt-4o");
        let secondary = ScriptedModel::answering("azure:gpt-4", "hello");
        let generator = Generator::initialize(
            retriever(&[]).await?,
            as_candidate(primary.clone()),
            as_candidate(secondary.clone()),
        )
        .await;

        assert_eq!(
            generator.state(),
            &GeneratorState::Ready {
                slot: ProviderSlot::Secondary,
                provider: "azure:gpt-4".to_string()
            }
        );
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(generator.call_model("ping").await.ok(), Some("hello".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn without_providers_requests_are_refused() -> Result<(), StoreError> {
        let missing = Err(ProviderError::MissingCredentials {
            provider: "openai".to_string(),
            setting: "OPENAI_API_KEY".to_string(),
        });
        let generator = Generator::initialize(
            retriever(&["pump manual"]).await?,
            missing,
            as_candidate(ScriptedModel::failing("azure:gpt-4")),
        )
        .await;

        assert!(matches!(generator.state(), GeneratorState::Failed { reason } if reason.contains("OPENAI_API_KEY")));
        let result = generator.generate(&RetrievalRequest::new("pump")).await;
        assert_eq!(result.status, GenerationStatus::Unavailable);
        assert_eq!(result.answer, UNAVAILABLE_ANSWER);
        assert!(result.metrics.error.is_some());
        assert!(matches!(
            generator.call_model("x").await,
            Err(ProviderError::Unavailable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn empty_context_skips_the_model() -> Result<(), StoreError> {
        let model = ScriptedModel::answering("openai:gpt-4o", "unused");
        let generator = Generator::initialize(
            retriever(&[]).await?,
            as_candidate(model.clone()),
            as_candidate(ScriptedModel::failing("azure")),
        )
        .await;

        let result = generator.generate(&RetrievalRequest::new("no matching content")).await;
        assert_eq!(result.status, GenerationStatus::NoContext);
        assert_eq!(result.answer, NO_CONTEXT_ANSWER);
        assert_eq!(result.metrics.generation_time_seconds, Some(0.0));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn answers_are_logged() -> Result<(), StoreError> {
        let records = Arc::new(InMemoryRecordStore::new());
        let generator = Generator::initialize(
            retriever(&["seals are replaced every 2000 hours"]).await?,
            as_candidate(ScriptedModel::answering("openai:gpt-4o", " Every 2000 hours. ")),
            as_candidate(ScriptedModel::failing("azure")),
        )
        .await
        .with_records(records.clone());

        let request = RetrievalRequest {
            collections: vec!["documents".to_string()],
            ..RetrievalRequest::new("when are seals replaced?")
        };
        let result = generator.generate(&request).await;
        assert_eq!(result.status, GenerationStatus::Success);
        assert_eq!(result.answer, "Every 2000 hours.");
        assert!(result.context.starts_with("[Source: Document doc-1]"));

        let log = records.query_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].query_type, "semantic");
        assert_eq!(log[0].document_ids, vec!["doc-1".to_string()]);
        assert_eq!(log[0].parameters["collection_names"], json!(["documents"]));
        Ok(())
    }

    #[tokio::test]
    async fn model_errors_become_results() -> Result<(), StoreError> {
        let flaky = Arc::new(FlakyModel {
            calls: AtomicUsize::new(0),
        });
        let records = Arc::new(InMemoryRecordStore::new());
        let generator = Generator::initialize(
            retriever(&["pump manual"]).await?,
            Ok(flaky as Arc<dyn LanguageModel>),
            as_candidate(ScriptedModel::failing("azure")),
        )
        .await
        .with_records(records.clone());

        let result = generator.generate(&RetrievalRequest::new("pump")).await;
        assert_eq!(result.status, GenerationStatus::Error);
        assert!(result.answer.starts_with("Error generating response:"));
        assert!(result.metrics.retrieval_time_seconds.is_some());
        assert_eq!(result.metrics.generation_time_seconds, None);
        assert!(records.query_log().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn log_failures_do_not_fail_the_answer() -> Result<(), StoreError> {
        let generator = Generator::initialize(
            retriever(&["pump manual"]).await?,
            as_candidate(ScriptedModel::answering("openai:gpt-4o", "ok")),
            as_candidate(ScriptedModel::failing("azure")),
        )
        .await
        .with_records(Arc::new(BrokenLog));

        let result = generator.generate(&RetrievalRequest::new("pump")).await;
        assert_eq!(result.status, GenerationStatus::Success);
        Ok(())
    }

    #[test]
    fn prompt_embeds_guardrails() {
        let prompt = render_prompt("[Source: a.pdf]\nfacts", "what {context}?");
        assert_eq!(prompt.matches(&format!("\"{REFUSAL_ANSWER}\"")).count(), 2);
        assert!(prompt.contains("only the information in the context"));
        assert!(prompt.ends_with("Question: what {context}?\n\nAnswer:"));
    }
}
