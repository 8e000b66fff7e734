//! Processing pipeline for strata.
//!
//! Turns a [`RawItem`](strata_shared::RawItem) into a
//! [`KnowledgeItem`](strata_shared::KnowledgeItem) by running four transforms
//! over its content: embedding, entity extraction, summarization and
//! classification. Language analysis goes through the [`TextAnalyzer`]
//! capability, which is either a hosted model or local heuristics.

pub mod analyzer;
pub mod classifier;
pub mod embedder;
pub mod entities;
pub mod pipeline;
pub mod summarizer;
pub mod tables;

use sha2::{Digest, Sha256};

pub use analyzer::{HostedAnalyzer, LocalAnalyzer, TextAnalyzer, build_analyzer, parse_json_reply};
pub use classifier::{Classification, Classifier};
pub use embedder::{EmbeddingBackend, Embedder, OpenAiEmbeddings, seeded_vector};
pub use entities::{EntityExtractor, Extraction, co_mentions, extract_rule_entities};
pub use pipeline::{ProcessingPipeline, ProcessingStats};
pub use summarizer::{Summarizer, Summary, extractive_summary};

/// Hex SHA-256 of a text, used as cache key.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
