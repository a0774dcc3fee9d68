use super::sentence::split_sentences;
use super::BreakpointThreshold;
use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::ProviderError;

/// Sentences on each side folded into a sentence's embedding window.
const BUFFER_SIZE: usize = 1;

const PERCENTILE: f64 = 95.0;
const STANDARD_DEVIATIONS: f64 = 3.0;
const INTERQUARTILE_SCALE: f64 = 1.5;

/// Groups consecutive sentences, starting a new group wherever the distance
/// between neighbouring sentence windows exceeds the breakpoint threshold.
pub(super) async fn split(
    text: &str,
    embedder: &dyn Embedder,
    threshold: BreakpointThreshold,
) -> Result<Vec<String>, ProviderError> {
    let sentences = split_sentences(text);
    if sentences.len() < 2 {
        return Ok(sentences.into_iter().map(str::to_string).collect());
    }

    let windows = sentence_windows(&sentences);
    let embeddings = embedder.embed_batch(&windows).await?;
    if embeddings.len() != windows.len() {
        return Err(ProviderError::InvalidResponse {
            provider: embedder.name().to_string(),
            details: format!(
                "expected {} embeddings, received {}",
                windows.len(),
                embeddings.len()
            ),
        });
    }

    let distances: Vec<f64> = embeddings
        .windows(2)
        .map(|pair| 1.0 - f64::from(cosine_similarity(&pair[0], &pair[1])))
        .collect();
    let breakpoints = breakpoints(&distances, threshold);

    let mut groups = Vec::with_capacity(breakpoints.len() + 1);
    let mut start = 0;
    for index in breakpoints {
        groups.push(sentences[start..=index].join(" "));
        start = index + 1;
    }
    if start < sentences.len() {
        groups.push(sentences[start..].join(" "));
    }
    Ok(groups)
}

fn sentence_windows(sentences: &[&str]) -> Vec<String> {
    (0..sentences.len())
        .map(|index| {
            let from = index.saturating_sub(BUFFER_SIZE);
            let to = (index + BUFFER_SIZE + 1).min(sentences.len());
            sentences[from..to].join(" ")
        })
        .collect()
}

/// Indices of sentences after which a new group starts.
fn breakpoints(distances: &[f64], threshold: BreakpointThreshold) -> Vec<usize> {
    let (scores, limit) = match threshold {
        BreakpointThreshold::Percentile => (distances.to_vec(), percentile(distances, PERCENTILE)),
        BreakpointThreshold::StandardDeviation => {
            let mean = mean(distances);
            let variance =
                distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / distances.len() as f64;
            (distances.to_vec(), mean + STANDARD_DEVIATIONS * variance.sqrt())
        }
        BreakpointThreshold::Interquartile => {
            let iqr = percentile(distances, 75.0) - percentile(distances, 25.0);
            (distances.to_vec(), mean(distances) + INTERQUARTILE_SCALE * iqr)
        }
        BreakpointThreshold::Gradient => {
            let gradient = gradient(distances);
            let limit = percentile(&gradient, PERCENTILE);
            (gradient, limit)
        }
    };

    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > limit)
        .map(|(index, _)| index)
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linear interpolation between closest ranks.
fn percentile(values: &[f64], percent: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = percent / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Central differences inside, one-sided differences at the edges.
fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return values.to_vec();
    }
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => (values[i + 1] - values[i - 1]) / 2.0,
        })
        .collect()
}
