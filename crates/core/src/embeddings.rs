use crate::config::{EmbeddingProviderKind, Settings};
use crate::error::ProviderError;
use crate::openai::{OpenAiClient, OpenAiEndpoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Turns text into vectors. One provider is chosen per process; collections
/// record its dimensionality when they are created.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Dimensionality the provider is configured to produce.
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                details: "empty embedding response".to_string(),
            })
    }
}

/// Deterministic trigram-hashing embedder. Needs no network, so it backs tests
/// and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "local-ngram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.vector(text)).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embeddings endpoint of OpenAI or an Azure OpenAI deployment.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: OpenAiClient,
    /// Model name for OpenAI, deployment name for Azure.
    target: String,
    dimensions: usize,
    label: String,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient, target: impl Into<String>, dimensions: usize) -> Self {
        let target = target.into();
        Self {
            label: format!("{}:{target}", client.provider()),
            client,
            target,
            dimensions,
        }
    }

    /// Only the `text-embedding-3` family accepts a requested dimensionality.
    fn requested_dimensions(&self) -> Option<usize> {
        self.target
            .contains("text-embedding-3")
            .then_some(self.dimensions)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.label
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(provider = %self.label, batch_size = texts.len(), "embedding batch");

        let model = match self.client.endpoint() {
            OpenAiEndpoint::OpenAi { .. } => Some(self.target.as_str()),
            OpenAiEndpoint::Azure { .. } => None,
        };
        let request = EmbeddingRequest {
            model,
            input: texts,
            dimensions: self.requested_dimensions(),
        };
        let mut response: EmbeddingResponse =
            self.client.post(&self.target, "embeddings", &request).await?;

        if response.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse {
                provider: self.label.clone(),
                details: format!(
                    "expected {} embeddings, received {}",
                    texts.len(),
                    response.data.len()
                ),
            });
        }
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Builds the configured embedding provider. Missing credentials are an error
/// here; there is no fallback to another provider.
pub fn build_embedder(settings: &Settings) -> Result<Arc<dyn Embedder>, ProviderError> {
    let embedder: Arc<dyn Embedder> = match settings.embedding_provider {
        EmbeddingProviderKind::OpenAi => Arc::new(OpenAiEmbedder::new(
            OpenAiClient::new(OpenAiEndpoint::openai(settings)?),
            settings.embedding_model.clone(),
            settings.embedding_dimensions,
        )),
        EmbeddingProviderKind::Azure => {
            let deployment = settings
                .azure_embedding_deployment
                .clone()
                .unwrap_or_else(|| settings.embedding_model.clone());
            Arc::new(OpenAiEmbedder::new(
                OpenAiClient::new(OpenAiEndpoint::azure(settings)?),
                deployment,
                settings.embedding_dimensions,
            ))
        }
        EmbeddingProviderKind::Local => Arc::new(CharacterNgramEmbedder {
            dimensions: settings.embedding_dimensions,
        }),
    };
    Ok(embedder)
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector {
            *value /= magnitude;
        }
    }
}
