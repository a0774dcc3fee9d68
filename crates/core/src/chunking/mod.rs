//! Splits extracted text into bounded-size segments.
//!
//! Four strategies are available. `recursive` works on characters, `token` on
//! model tokens, `sentence` packs whole sentences into a token budget and
//! `semantic` breaks where the embedding distance between neighbouring
//! sentences jumps. Every strategy degrades to `recursive` instead of failing.

mod recursive;
mod semantic;
mod sentence;
mod token;

pub use recursive::RecursiveSplitter;
pub use sentence::split_sentences;
pub use token::{TiktokenTokenizer, Tokenizer};

use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::models::{Segment, CHUNK_INDEX_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Average characters per model token, used to turn a character budget into a
/// token budget.
pub const CHARS_PER_TOKEN: usize = 4;

/// Upper bound on the sentence strategy's token overlap.
pub const MAX_SENTENCE_OVERLAP_TOKENS: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    #[default]
    Recursive,
    Token,
    Sentence,
    Semantic,
}

impl ChunkingStrategy {
    /// Parses a strategy name, resolving anything unknown to `Recursive`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|error: String| {
            warn!(%error, "unknown chunking strategy, falling back to recursive");
            Self::Recursive
        })
    }
}

impl FromStr for ChunkingStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "recursive" => Ok(Self::Recursive),
            "token" => Ok(Self::Token),
            "sentence" => Ok(Self::Sentence),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!("unknown chunking strategy '{other}'")),
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recursive => "recursive",
            Self::Token => "token",
            Self::Sentence => "sentence",
            Self::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

/// Rule used by the semantic strategy to decide which sentence distances are breakpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointThreshold {
    #[default]
    Percentile,
    StandardDeviation,
    Interquartile,
    Gradient,
}

impl FromStr for BreakpointThreshold {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "percentile" => Ok(Self::Percentile),
            "standard_deviation" => Ok(Self::StandardDeviation),
            "interquartile" => Ok(Self::Interquartile),
            "gradient" => Ok(Self::Gradient),
            other => Err(format!("unknown breakpoint threshold type '{other}'")),
        }
    }
}

impl fmt::Display for BreakpointThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Percentile => "percentile",
            Self::StandardDeviation => "standard_deviation",
            Self::Interquartile => "interquartile",
            Self::Gradient => "gradient",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Characters for `recursive`/`semantic`, tokens for `token`.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
    pub breakpoint_threshold: BreakpointThreshold,
    pub min_chunk_size: usize,
    pub tokenizer_model: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Recursive,
            chunk_size: 1_000,
            chunk_overlap: 200,
            separators: Self::default_separators(),
            breakpoint_threshold: BreakpointThreshold::Percentile,
            min_chunk_size: 100,
            tokenizer_model: "gpt-4o".to_string(),
        }
    }
}

impl ChunkingConfig {
    pub fn default_separators() -> Vec<String> {
        ["\n\n", "\n", ". ", " ", ""]
            .iter()
            .map(|separator| separator.to_string())
            .collect()
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn sentence_token_budget(&self) -> usize {
        (self.chunk_size / CHARS_PER_TOKEN).max(1)
    }

    pub fn sentence_overlap_tokens(&self) -> usize {
        (self.chunk_overlap / CHARS_PER_TOKEN).min(MAX_SENTENCE_OVERLAP_TOKENS)
    }
}

/// The chunking engine. Cheap to clone; construct once and share.
#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    recursive: RecursiveSplitter,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer.is_some())
            .field("embedder", &self.embedder.as_ref().map(|embedder| embedder.name()))
            .finish()
    }
}

impl Chunker {
    /// Validates the configuration and loads a tokenizer when the strategy needs one.
    /// A tokenizer that cannot be loaded is logged and the strategy degrades at split time.
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;

        let tokenizer: Option<Arc<dyn Tokenizer>> = match config.strategy {
            ChunkingStrategy::Token | ChunkingStrategy::Sentence => {
                match TiktokenTokenizer::for_model(&config.tokenizer_model) {
                    Ok(tokenizer) => Some(Arc::new(tokenizer)),
                    Err(error) => {
                        warn!(model = %config.tokenizer_model, %error, "tokenizer unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            strategy = %config.strategy,
            chunk_size = config.chunk_size,
            chunk_overlap = config.chunk_overlap,
            "chunker initialised"
        );

        Ok(Self {
            recursive: RecursiveSplitter::new(
                config.chunk_size,
                config.chunk_overlap,
                config.separators.clone(),
            ),
            config,
            tokenizer,
            embedder: None,
        })
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Embedding provider used by the semantic strategy.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn strategy(&self) -> ChunkingStrategy {
        self.config.strategy
    }

    /// Summary of the active configuration.
    pub fn describe(&self) -> Value {
        let semantic = self.config.strategy == ChunkingStrategy::Semantic;
        let token = self.config.strategy == ChunkingStrategy::Token;
        json!({
            "strategy": self.config.strategy.to_string(),
            "chunk_size": self.config.chunk_size,
            "chunk_overlap": self.config.chunk_overlap,
            "separators": self.config.separators,
            "min_chunk_size": self.config.min_chunk_size,
            "breakpoint_threshold_type": semantic.then(|| self.config.breakpoint_threshold.to_string()),
            "tokenizer_model": token.then(|| self.config.tokenizer_model.clone()),
        })
    }

    pub async fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if text.trim().chars().count() < self.config.min_chunk_size {
            return vec![text.to_string()];
        }

        let pieces = match self.config.strategy {
            ChunkingStrategy::Recursive => self.recursive.split(text),
            ChunkingStrategy::Token => match &self.tokenizer {
                Some(tokenizer) => match token::split(
                    text,
                    tokenizer.as_ref(),
                    self.config.chunk_size,
                    self.config.chunk_overlap,
                ) {
                    Ok(pieces) => pieces,
                    Err(error) => {
                        warn!(%error, "token chunking failed, falling back to recursive");
                        self.recursive.split(text)
                    }
                },
                None => {
                    warn!("token chunking has no tokenizer, falling back to recursive");
                    self.recursive.split(text)
                }
            },
            ChunkingStrategy::Sentence => {
                let count = |piece: &str| match &self.tokenizer {
                    Some(tokenizer) => tokenizer.count(piece),
                    None => piece.chars().count().div_ceil(CHARS_PER_TOKEN),
                };
                sentence::split(
                    text,
                    self.config.sentence_token_budget(),
                    self.config.sentence_overlap_tokens(),
                    count,
                )
            }
            ChunkingStrategy::Semantic => self.split_semantic(text).await,
        };

        self.enforce_min_size(pieces)
    }

    /// Splits each segment, copying its metadata onto every piece and numbering
    /// pieces per source segment.
    pub async fn split_segments(&self, segments: &[Segment]) -> Vec<Segment> {
        let mut out = Vec::new();
        for segment in segments {
            let pieces = self.split(&segment.text).await;
            let total = pieces.len();
            for (index, piece) in pieces.into_iter().enumerate() {
                let mut metadata = segment.metadata.clone();
                if total > 1 && !metadata.contains_key(CHUNK_INDEX_KEY) {
                    metadata.insert("split_index".to_string(), json!(index));
                }
                out.push(Segment::new(piece, metadata));
            }
        }
        out
    }

    async fn split_semantic(&self, text: &str) -> Vec<String> {
        let Some(embedder) = &self.embedder else {
            warn!("semantic chunking has no embedding provider, falling back to recursive");
            return self.recursive.split(text);
        };

        match semantic::split(text, embedder.as_ref(), self.config.breakpoint_threshold).await {
            Ok(groups) => {
                debug!(groups = groups.len(), "semantic breakpoints found");
                groups
                    .into_iter()
                    .flat_map(|group| {
                        if group.chars().count() > self.config.chunk_size {
                            self.recursive.split(&group)
                        } else {
                            vec![group]
                        }
                    })
                    .collect()
            }
            Err(error) => {
                warn!(%error, "semantic chunking failed, falling back to recursive");
                self.recursive.split(text)
            }
        }
    }

    /// Removes blank pieces and enforces the minimum size. A short piece is
    /// folded into its predecessor, minus the overlap it carried over, when the
    /// result still fits; otherwise it is dropped.
    fn enforce_min_size(&self, pieces: Vec<String>) -> Vec<String> {
        let limit = self.in_chars(self.config.chunk_size);
        let overlap = self.in_chars(self.config.chunk_overlap);
        let mut out: Vec<String> = Vec::with_capacity(pieces.len());
        let mut dropped = 0usize;

        for piece in pieces {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.chars().count() >= self.config.min_chunk_size {
                out.push(trimmed.to_string());
                continue;
            }

            let folded = out.last_mut().is_some_and(|previous| {
                let fresh = trimmed[carried_overlap(previous, trimmed, overlap)..].trim_start();
                if previous.chars().count() + 1 + fresh.chars().count() > limit {
                    return false;
                }
                previous.push(' ');
                previous.push_str(fresh);
                true
            });
            if !folded {
                dropped += 1;
            }
        }

        if dropped > 0 {
            debug!(
                dropped,
                min_chunk_size = self.config.min_chunk_size,
                "short segments dropped"
            );
        }
        out
    }

    fn in_chars(&self, amount: usize) -> usize {
        match self.config.strategy {
            ChunkingStrategy::Token => amount.saturating_mul(CHARS_PER_TOKEN),
            _ => amount,
        }
    }
}

/// Byte length of the longest proper prefix of `piece`, at most `max_chars`
/// characters, that `previous` ends with.
fn carried_overlap(previous: &str, piece: &str, max_chars: usize) -> usize {
    piece
        .char_indices()
        .skip(1)
        .take(max_chars)
        .map(|(end, _)| end)
        .filter(|&end| previous.ends_with(&piece[..end]))
        .last()
        .unwrap_or(0)
}
