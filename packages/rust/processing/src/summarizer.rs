//! Summaries: unchanged short text, extractive packing, or the hosted analyzer.

use std::sync::Arc;

use tracing::debug;

use crate::analyzer::TextAnalyzer;

/// Text at or under this length is its own summary.
pub const SHORT_TEXT_CHARS: usize = 300;

/// Text longer than this goes to a hosted analyzer, when there is one.
pub const HOSTED_MIN_CHARS: usize = 1000;

/// Character budget of a summary.
pub const SUMMARY_BUDGET: usize = 300;

const KEYWORDS: &[&str] = &[
    "announce",
    "launch",
    "release",
    "introduce",
    "new",
    "first",
    "record",
    "million",
    "billion",
    "breaking",
    "important",
    "significant",
    "because",
    "result",
];

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?' | '\n')
            && chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        if at_boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn score_sentence(sentence: &str, index: usize, total: usize) -> f64 {
    let mut score = 0.0;
    if index == 0 {
        score += 2.0;
    } else if index + 1 == total {
        score += 1.0;
    }

    let len = sentence.chars().count();
    if (40..=200).contains(&len) {
        score += 1.0;
    }

    let lower = sentence.to_lowercase();
    let hits = KEYWORDS.iter().filter(|k| lower.contains(*k)).count();
    score += hits as f64 * 0.5;
    if sentence.chars().any(|c| c.is_ascii_digit()) {
        score += 0.5;
    }
    score
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed.trim_end())
}

/// Greedily pack the best-scoring sentences under `max_chars`, in document order.
pub fn extractive_summary(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let sentences = split_sentences(text);
    let total = sentences.len();
    let mut ranked: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (i, score_sentence(s, i, total)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut chosen = Vec::new();
    let mut used = 0;
    for (index, _) in ranked {
        let len = sentences[index].chars().count();
        let needed = if chosen.is_empty() { len } else { len + 1 };
        if used + needed <= max_chars {
            chosen.push(index);
            used += needed;
        }
    }

    if chosen.is_empty() {
        return truncate_at_word(sentences.first().copied().unwrap_or(text), max_chars);
    }
    chosen.sort_unstable();
    chosen
        .into_iter()
        .map(|i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Summarizer {
    analyzer: Arc<dyn TextAnalyzer>,
    budget: usize,
}

/// Result of one summarization.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    /// The hosted analyzer failed and the extractive method was used instead.
    pub degraded: bool,
}

impl Summarizer {
    pub fn new(analyzer: Arc<dyn TextAnalyzer>) -> Self {
        Self {
            analyzer,
            budget: SUMMARY_BUDGET,
        }
    }

    pub async fn summarize(&self, text: &str) -> Summary {
        let len = text.chars().count();
        if len <= SHORT_TEXT_CHARS {
            return Summary {
                text: text.trim().to_string(),
                degraded: false,
            };
        }

        if len > HOSTED_MIN_CHARS && self.analyzer.is_hosted() {
            match self.analyzer.summarize(text, self.budget).await {
                Ok(summary) => {
                    return Summary {
                        text: summary,
                        degraded: false,
                    };
                }
                Err(e) => {
                    debug!(analyzer = self.analyzer.name(), error = %e, "summary degraded to extractive");
                    return Summary {
                        text: extractive_summary(text, self.budget),
                        degraded: true,
                    };
                }
            }
        }

        Summary {
            text: extractive_summary(text, self.budget),
            degraded: false,
        }
    }
}
