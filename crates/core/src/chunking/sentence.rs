const TERMINATORS: [char; 3] = ['.', '!', '?'];
const CLOSERS: [char; 4] = ['"', '\'', ')', ']'];

/// Splits at terminal punctuation followed by whitespace. Each sentence keeps
/// its punctuation and any closing quote or bracket; surrounding whitespace is
/// trimmed and blanks are skipped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !TERMINATORS.contains(&c) {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                chars.next();
            } else {
                break;
            }
        }
        if let Some(&(boundary, next)) = chars.peek() {
            if next.is_whitespace() {
                push_trimmed(&mut sentences, &text[start..boundary]);
                start = boundary;
            }
        }
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed<'a>(sentences: &mut Vec<&'a str>, candidate: &'a str) {
    let sentence = candidate.trim();
    if !sentence.is_empty() {
        sentences.push(sentence);
    }
}

/// Packs whole sentences into chunks of at most `budget` tokens, carrying up to
/// `overlap` tokens of trailing sentences into the next chunk. A sentence over
/// budget is packed word by word instead.
pub(super) fn split<F>(text: &str, budget: usize, overlap: usize, count: F) -> Vec<String>
where
    F: Fn(&str) -> usize,
{
    let mut units: Vec<(String, usize)> = Vec::new();
    for sentence in split_sentences(text) {
        let tokens = count(sentence);
        if tokens <= budget {
            units.push((sentence.to_string(), tokens));
        } else {
            units.extend(pack_words(sentence, budget, &count));
        }
    }

    let mut chunks = Vec::new();
    let mut window: Vec<(String, usize)> = Vec::new();
    let mut total = 0usize;

    for (unit, tokens) in units {
        if total + tokens > budget && !window.is_empty() {
            chunks.push(join(&window));

            let mut carried = Vec::new();
            let mut carried_tokens = 0;
            for (previous, previous_tokens) in window.iter().rev() {
                if carried_tokens + previous_tokens > overlap
                    || carried_tokens + previous_tokens + tokens > budget
                {
                    break;
                }
                carried_tokens += previous_tokens;
                carried.push((previous.clone(), *previous_tokens));
            }
            carried.reverse();
            window = carried;
            total = carried_tokens;
        }
        window.push((unit, tokens));
        total += tokens;
    }
    if !window.is_empty() {
        chunks.push(join(&window));
    }

    chunks
}

fn pack_words<F>(sentence: &str, budget: usize, count: &F) -> Vec<(String, usize)>
where
    F: Fn(&str) -> usize,
{
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if count(&candidate) > budget && !current.is_empty() {
            let tokens = count(&current);
            pieces.push((std::mem::take(&mut current), tokens));
            current = word.to_string();
        } else {
            current = candidate;
        }
    }
    if !current.is_empty() {
        let tokens = count(&current);
        pieces.push((current, tokens));
    }
    pieces
}

fn join(window: &[(String, usize)]) -> String {
    window
        .iter()
        .map(|(unit, _)| unit.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> usize {
        text.split_whitespace().count()
    }

    #[test]
    fn sentences_keep_terminal_punctuation() {
        let sentences = split_sentences("Is it? Yes! It is. (Quoted.) tail");
        assert_eq!(sentences, vec!["Is it?", "Yes!", "It is.", "(Quoted.)", "tail"]);
    }

    #[test]
    fn sentences_are_packed_into_budget() {
        let text = "One two three. Four five. Six seven eight. Nine.";
        let chunks = split(text, 5, 0, words);
        assert_eq!(
            chunks,
            vec!["One two three. Four five.", "Six seven eight. Nine."]
        );
    }

    #[test]
    fn trailing_sentences_are_carried_as_overlap() {
        let text = "A b. C d. E f. G h.";
        let chunks = split(text, 4, 2, words);
        assert_eq!(chunks, vec!["A b. C d.", "C d. E f.", "E f. G h."]);
    }

    #[test]
    fn overlong_sentence_is_packed_by_words() {
        let chunks = split("a b c d e f g.", 3, 0, words);
        assert_eq!(chunks, vec!["a b c", "d e f", "g."]);
    }
}
