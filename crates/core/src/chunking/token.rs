use crate::error::IngestError;
use tiktoken_rs::CoreBPE;

/// Model tokenizer used to bound segments in tokens rather than characters.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, tokens: &[u32]) -> Result<String, IngestError>;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// BPE tokenizer matching an OpenAI model family. Unknown model names use
/// `cl100k_base`.
pub struct TiktokenTokenizer {
    model: String,
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn for_model(model: &str) -> Result<Self, IngestError> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map_err(|error| IngestError::InvalidChunkConfig(format!("tokenizer: {error}")))?;
        Ok(Self {
            model: model.to_string(),
            bpe,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, IngestError> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|error| IngestError::InvalidArgument(format!("token decode: {error}")))
    }
}

/// Fixed windows of `chunk_size` tokens advancing by `chunk_size - chunk_overlap`.
pub(super) fn split(
    text: &str,
    tokenizer: &dyn Tokenizer,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<String>, IngestError> {
    let tokens = tokenizer.encode(text);
    let step = chunk_size.saturating_sub(chunk_overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + chunk_size).min(tokens.len());
        chunks.push(tokenizer.decode(&tokens[start..end])?);
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per whitespace-separated word.
    struct WordTokenizer {
        vocabulary: Vec<String>,
    }

    impl WordTokenizer {
        fn new(text: &str) -> Self {
            Self {
                vocabulary: text.split_whitespace().map(str::to_string).collect(),
            }
        }
    }

    impl Tokenizer for WordTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.split_whitespace()
                .filter_map(|word| self.vocabulary.iter().position(|known| known == word))
                .map(|position| position as u32)
                .collect()
        }

        fn decode(&self, tokens: &[u32]) -> Result<String, IngestError> {
            Ok(tokens
                .iter()
                .map(|token| self.vocabulary[*token as usize].as_str())
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    #[test]
    fn windows_advance_by_size_minus_overlap() -> Result<(), IngestError> {
        let text = "t0 t1 t2 t3 t4 t5 t6";
        let tokenizer = WordTokenizer::new(text);
        let chunks = split(text, &tokenizer, 3, 1)?;
        assert_eq!(chunks, vec!["t0 t1 t2", "t2 t3 t4", "t4 t5 t6"]);
        Ok(())
    }

    #[test]
    fn tiktoken_counts_are_bounded_by_window() -> Result<(), IngestError> {
        let tokenizer = TiktokenTokenizer::for_model("gpt-4")?;
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let chunks = split(&text, &tokenizer, 16, 4)?;
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(tokenizer.count(chunk) <= 16);
        }
        Ok(())
    }
}
