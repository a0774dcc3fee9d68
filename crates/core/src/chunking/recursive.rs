use std::collections::VecDeque;

/// Character-measured splitter that tries each separator in turn, from
/// paragraph breaks down to single characters, and re-merges the pieces into
/// windows of at most `chunk_size` characters overlapping by `chunk_overlap`.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize, separators: Vec<String>) -> Self {
        let mut separators = separators;
        if separators.last().map(String::as_str) != Some("") {
            separators.push(String::new());
        }
        Self {
            chunk_size,
            chunk_overlap,
            separators,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();

        let (position, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, separator)| separator.is_empty() || text.contains(separator.as_str()))
            .map(|(position, separator)| (position, separator.as_str()))
            .unwrap_or((separators.len(), ""));
        let finer = separators.get(position + 1..).unwrap_or_default();

        let mut pending: Vec<&str> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            if finer.is_empty() {
                chunks.push(piece.trim().to_string());
            } else {
                chunks.extend(self.split_with(piece, finer));
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }

        chunks.retain(|chunk| !chunk.is_empty());
        chunks
    }

    /// Packs small pieces into windows. After each emitted window the oldest
    /// pieces are released until what is left fits inside the overlap.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut merged = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let length = char_len(piece);
            if total + length > self.chunk_size && !window.is_empty() {
                push_trimmed(&mut merged, &window);
                while total > self.chunk_overlap
                    || (total + length > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some(released) => total -= char_len(released),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += length;
        }
        push_trimmed(&mut merged, &window);

        merged
    }
}

fn push_trimmed(merged: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        merged.push(trimmed.to_string());
    }
}

/// Splits after every occurrence of `separator`, so each piece carries its
/// trailing separator. An empty separator splits into characters.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(start, c)| &text[start..start + c.len_utf8()])
            .collect();
    }
    text.split_inclusive(separator)
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;

    fn splitter(size: usize, overlap: usize) -> RecursiveSplitter {
        RecursiveSplitter::new(size, overlap, ChunkingConfig::default_separators())
    }

    #[test]
    fn adjacent_windows_share_the_overlap() {
        let pieces = splitter(12, 5).split("one two three four five six");
        assert_eq!(
            pieces,
            vec!["one two", "two three", "four five", "five six"]
        );
    }

    #[test]
    fn long_words_are_cut_into_characters() {
        let pieces = splitter(4, 0).split("abcdefghij");
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn multibyte_text_is_measured_in_characters() {
        let pieces = splitter(3, 0).split("ééé ààà");
        assert_eq!(pieces, vec!["ééé", "ààà"]);
    }

    #[test]
    fn missing_character_separator_is_appended() {
        let splitter = RecursiveSplitter::new(3, 0, vec!["\n".to_string()]);
        assert_eq!(splitter.split("abcdef"), vec!["abc", "def"]);
    }
}
