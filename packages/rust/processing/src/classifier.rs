//! Rule-based topic, sentiment, importance and confidence scoring.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Topic assigned when no keyword list matches.
pub const GENERAL_TOPIC: &str = "general";

const MAX_TOPICS: usize = 3;

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "crypto",
        &[
            "bitcoin", "btc", "ethereum", "eth", "solana", "sol", "crypto", "blockchain",
            "token", "defi", "nft", "airdrop", "web3", "wallet", "stablecoin", "validator",
        ],
    ),
    (
        "ai",
        &[
            "ai", "llm", "gpt", "model", "models", "neural", "openai", "anthropic", "agent",
            "agents", "inference", "training", "transformer",
        ],
    ),
    (
        "development",
        &[
            "rust", "python", "javascript", "typescript", "code", "api", "library", "framework",
            "compiler", "developer", "developers", "github", "open-source", "sdk", "release",
        ],
    ),
    (
        "finance",
        &[
            "market", "stock", "stocks", "price", "trading", "investor", "investors", "fund",
            "revenue", "earnings", "inflation", "rates",
        ],
    ),
    (
        "security",
        &[
            "security", "vulnerability", "exploit", "hack", "hacked", "breach", "cve", "malware",
            "phishing",
        ],
    ),
    (
        "business",
        &[
            "startup", "acquisition", "acquires", "funding", "ceo", "company", "layoffs",
            "raises", "valuation",
        ],
    ),
    (
        "science",
        &[
            "research", "study", "paper", "physics", "biology", "scientists", "experiment",
        ],
    ),
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "bullish", "surge", "surges", "gain", "gains", "growth", "success",
    "win", "wins", "rise", "rises", "positive", "strong", "record", "breakthrough", "improve",
    "improves", "rally", "rallies", "profit", "excellent", "love", "upgrade", "soars",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "bearish", "crash", "crashes", "drop", "drops", "loss", "losses", "fail", "fails",
    "decline", "negative", "weak", "hack", "hacked", "exploit", "scam", "lawsuit", "fear",
    "dump", "layoffs", "bug", "vulnerability", "outage", "plunge",
];

const URGENCY_WORDS: &[&str] = &["breaking", "urgent", "alert", "emergency", "just"];
const ANNOUNCEMENT_WORDS: &[&str] = &[
    "announce",
    "announces",
    "announced",
    "launch",
    "launches",
    "launched",
    "release",
    "releases",
    "released",
    "introducing",
    "unveils",
];

/// Classifier output for one text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub topics: BTreeSet<String>,
    /// In `[-1, 1]`.
    pub sentiment: f64,
    /// In `[0, 100]`.
    pub importance: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '$'))
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_start_matches('$').to_lowercase())
        .collect()
}

fn count_hits(words: &[String], list: &[&str]) -> usize {
    words.iter().filter(|w| list.contains(&w.as_str())).count()
}

/// Pure rule-based classifier. Stateless; no external calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> Classification {
        let words = words(text);

        let (topics, topic_hits) = topics(&words);
        let positive = count_hits(&words, POSITIVE_WORDS);
        let negative = count_hits(&words, NEGATIVE_WORDS);

        Classification {
            topics,
            sentiment: sentiment(positive, negative),
            importance: importance(text, &words),
            confidence: confidence(text, words.len(), topic_hits + positive + negative),
        }
    }
}

/// Top topics by keyword hits, ties broken by name. Also returns total hits.
fn topics(words: &[String]) -> (BTreeSet<String>, usize) {
    let mut scored: Vec<(&str, usize)> = TOPIC_KEYWORDS
        .iter()
        .map(|(topic, keywords)| (*topic, count_hits(words, keywords)))
        .filter(|(_, hits)| *hits > 0)
        .collect();
    let total: usize = scored.iter().map(|(_, hits)| hits).sum();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let mut topics: BTreeSet<String> = scored
        .into_iter()
        .take(MAX_TOPICS)
        .map(|(topic, _)| topic.to_string())
        .collect();
    if topics.is_empty() {
        topics.insert(GENERAL_TOPIC.to_string());
    }
    (topics, total)
}

fn sentiment(positive: usize, negative: usize) -> f64 {
    let total = positive + negative;
    if total == 0 {
        return 0.0;
    }
    (positive as f64 - negative as f64) / total as f64
}

fn importance(text: &str, words: &[String]) -> f64 {
    static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\$\s?\d|\b\d+(\.\d+)?\s?(million|billion|trillion|[mb]n?)\b")
            .expect("valid regex")
    });
    static PERCENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+(\.\d+)?\s?%").expect("valid regex"));
    static NAMED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$[A-Z]{2,10}\b|\b[A-Z][a-z]+(\s[A-Z][a-z]+)+\b").expect("valid regex")
    });

    let mut score: f64 = 50.0;
    if count_hits(words, URGENCY_WORDS) > 0 {
        score += 15.0;
    }
    if MONEY_RE.is_match(text) {
        score += 10.0;
    }
    if PERCENT_RE.is_match(text) {
        score += 10.0;
    }
    if NAMED_RE.is_match(text) {
        score += 5.0;
    }
    if text.len() > 500 {
        score += 5.0;
    }
    if count_hits(words, ANNOUNCEMENT_WORDS) > 0 {
        score += 10.0;
    }
    score.clamp(0.0, 100.0)
}

fn confidence(text: &str, word_count: usize, keyword_hits: usize) -> f64 {
    let mut score: f64 = 0.5;
    if text.len() > 200 {
        score += 0.1;
    }
    if text.len() > 1000 {
        score += 0.1;
    }
    if word_count > 0 {
        let density = keyword_hits as f64 / word_count as f64;
        if density > 0.05 {
            score += 0.1;
        }
        if density > 0.1 {
            score += 0.1;
        }
    }
    score.clamp(0.0, 1.0)
}
