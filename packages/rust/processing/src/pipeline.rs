//! Raw item → knowledge item.
//!
//! The four transforms run concurrently over the same content. Each one
//! degrades on its own (fallback path); only invalid input fails the item.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use strata_shared::{
    AppConfig, ContentType, KnowledgeContent, KnowledgeItem, KnowledgeSource, Metadata, RawItem,
    Result, StrataError,
};

use crate::analyzer::{TextAnalyzer, build_analyzer};
use crate::classifier::Classifier;
use crate::embedder::Embedder;
use crate::entities::{EntityExtractor, co_mentions};
use crate::summarizer::Summarizer;
use crate::tables::{content_type, source_profile};

/// Metadata keys that count as engagement signals.
const ENGAGEMENT_KEYS: &[&str] = &[
    "points",
    "comments",
    "likes",
    "retweets",
    "reactions",
    "stars",
    "score",
    "upvotes",
];

/// Price items stop being relevant after a day.
const PRICE_TTL_HOURS: i64 = 24;

/// Counters exposed through pipeline stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub processed: u64,
    pub failed: u64,
    /// Sub-transforms that fell back to a local heuristic.
    pub degraded: u64,
}

pub struct ProcessingPipeline {
    embedder: Arc<Embedder>,
    extractor: EntityExtractor,
    summarizer: Summarizer,
    classifier: Classifier,
    processed: AtomicU64,
    failed: AtomicU64,
    degraded: AtomicU64,
}

impl ProcessingPipeline {
    pub fn new(embedder: Arc<Embedder>, analyzer: Arc<dyn TextAnalyzer>) -> Self {
        Self {
            embedder,
            extractor: EntityExtractor::new(analyzer.clone()),
            summarizer: Summarizer::new(analyzer),
            classifier: Classifier::new(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    /// Build the embedder and analyzer selected in config.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let analyzer = build_analyzer(&config.analyzer)?;
        Ok(Self::new(embedder, analyzer))
    }

    pub fn embedder(&self) -> Arc<Embedder> {
        self.embedder.clone()
    }

    pub fn stats(&self) -> ProcessingStats {
        ProcessingStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed) + self.embedder.degraded_count(),
        }
    }

    /// Turn one raw item into a knowledge item with the same id.
    #[instrument(skip_all, fields(id = %raw.id, source = %raw.source))]
    pub async fn process(&self, raw: &RawItem) -> Result<KnowledgeItem> {
        let text = raw.content.trim();
        if text.is_empty() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(StrataError::validation(format!(
                "raw item {} has no content",
                raw.id
            )));
        }

        let (embedding, extraction, summary, classification) = tokio::join!(
            self.embedder.embed_one(text),
            self.extractor.extract(text),
            self.summarizer.summarize(text),
            async { self.classifier.classify(text) },
        );

        let degraded = u64::from(extraction.degraded) + u64::from(summary.degraded);
        if degraded > 0 {
            self.degraded.fetch_add(degraded, Ordering::Relaxed);
        }

        let profile = source_profile(raw.source_type);
        let kind = content_type(&raw.source, &raw.kind);
        let relationships = co_mentions(&extraction.entities, &raw.id);
        let quality = quality(
            text.chars().count(),
            &raw.metadata,
            classification.confidence,
            profile.credibility,
        );

        let item = KnowledgeItem {
            id: raw.id.clone(),
            source: KnowledgeSource {
                kind: profile.source_type,
                name: raw.source.clone(),
                url: raw
                    .metadata
                    .get("url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                credibility: profile.credibility,
            },
            content: KnowledgeContent {
                raw: text.to_string(),
                summary: summary.text,
                kind,
            },
            embedding,
            entities: extraction.entities,
            relationships,
            topics: classification.topics,
            sentiment: classification.sentiment,
            importance: classification.importance,
            timestamp: raw.timestamp,
            expires_at: (kind == ContentType::Price)
                .then(|| raw.timestamp + Duration::hours(PRICE_TTL_HOURS)),
            decay_rate: profile.decay_rate,
            processed: true,
            quality,
        };

        self.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            topics = ?item.topics,
            entities = item.entities.len(),
            quality = item.quality,
            "item processed"
        );
        Ok(item)
    }

    /// Process a batch in order, skipping (and counting) items that fail.
    pub async fn process_batch(&self, raws: &[RawItem]) -> Vec<KnowledgeItem> {
        let mut items = Vec::with_capacity(raws.len());
        for raw in raws {
            match self.process(raw).await {
                Ok(item) => items.push(item),
                Err(e) => warn!(id = %raw.id, error = %e, "skipping raw item"),
            }
        }
        items
    }
}

fn has_engagement(metadata: &Metadata) -> bool {
    ENGAGEMENT_KEYS.iter().any(|key| {
        metadata
            .get(*key)
            .and_then(|v| v.as_f64())
            .is_some_and(|n| n > 0.0)
    })
}

/// Weighted sum of length tier, engagement, classifier confidence and credibility.
pub fn quality(chars: usize, metadata: &Metadata, confidence: f64, credibility: f64) -> f64 {
    let length = match chars {
        n if n > 1000 => 30.0,
        n if n > 300 => 20.0,
        n if n > 100 => 10.0,
        _ => 5.0,
    };
    let engagement = if has_engagement(metadata) { 20.0 } else { 0.0 };
    (length + engagement + confidence * 20.0 + credibility * 0.3).clamp(0.0, 100.0)
}
