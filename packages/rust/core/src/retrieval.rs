//! Semantic, keyword and hybrid search with reranking, plus direct views.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use strata_shared::{EmbedText, KnowledgeItem, Result, ScoredKnowledge, StrataError};
use strata_storage::StorageOrchestrator;

/// Results under this score are dropped unless the caller says otherwise.
pub const DEFAULT_MIN_SCORE: f64 = 0.3;

pub const SEMANTIC_WEIGHT: f64 = 0.7;
pub const KEYWORD_WEIGHT: f64 = 0.3;

/// Candidates fetched per requested result, to leave room for filtering.
const OVERFETCH: usize = 2;

const DAY_MS: f64 = 86_400_000.0;
const RECENCY_BOOST: f64 = 0.2;
const IMPORTANCE_BOOST: f64 = 0.15;
const QUALITY_BOOST: f64 = 0.1;

/// Constraints applied to every candidate before scoring cut-offs.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Allow-list of source names.
    pub sources: Option<Vec<String>>,
    /// Item must carry at least one of these topics.
    pub topics: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_importance: Option<f64>,
}

impl SearchFilters {
    pub fn matches(&self, item: &KnowledgeItem) -> bool {
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| *s == item.source.name) {
                return false;
            }
        }
        if let Some(topics) = &self.topics {
            if !topics.iter().any(|t| item.has_topic(t)) {
                return false;
            }
        }
        if self.since.is_some_and(|since| item.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| item.timestamp > until) {
            return false;
        }
        if self.min_importance.is_some_and(|min| item.importance < min) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: f64,
    pub filters: SearchFilters,
    pub rerank: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: DEFAULT_MIN_SCORE,
            filters: SearchFilters::default(),
            rerank: true,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Apply recency, then importance, then quality boosts to a base score.
///
/// The recency boost decays linearly from +20% at age 0 to nothing at 24h
/// and is never applied to older (or future-dated) items.
pub fn rerank_score(score: f64, item: &KnowledgeItem, now: DateTime<Utc>) -> f64 {
    let mut score = score;
    let age = item.age_ms(now) as f64;
    if (0.0..DAY_MS).contains(&age) {
        score *= 1.0 + RECENCY_BOOST * (1.0 - age / DAY_MS);
    }
    score *= 1.0 + item.importance / 100.0 * IMPORTANCE_BOOST;
    score *= 1.0 + item.quality / 100.0 * QUALITY_BOOST;
    score
}

fn by_score_desc(a: &ScoredKnowledge, b: &ScoredKnowledge) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.item.id.cmp(&b.item.id))
}

/// Lowercased distinct words of a query.
fn query_words(query: &str) -> Vec<String> {
    let words: BTreeSet<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    words.into_iter().collect()
}

/// Fraction of `words` found in `text`.
pub fn keyword_score(words: &[String], text: &str) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let text = text.to_lowercase();
    let matched = words.iter().filter(|w| text.contains(w.as_str())).count();
    matched as f64 / words.len() as f64
}

pub struct RetrievalSystem {
    storage: Arc<StorageOrchestrator>,
    embedder: Arc<dyn EmbedText>,
}

impl RetrievalSystem {
    pub fn new(storage: Arc<StorageOrchestrator>, embedder: Arc<dyn EmbedText>) -> Self {
        Self { storage, embedder }
    }

    /// Semantic search.
    #[instrument(skip(self, options), fields(limit = options.limit))]
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredKnowledge>> {
        let embedding = self.embedder.embed(query).await?;
        let candidates = self
            .storage
            .search(&embedding, options.limit.saturating_mul(OVERFETCH), options.min_score)
            .await?;
        debug!(candidates = candidates.len(), "semantic candidates");
        Ok(finish(candidates, options, Utc::now()))
    }

    /// Semantic and keyword search fused 0.7 / 0.3 by item id.
    #[instrument(skip(self, options), fields(limit = options.limit))]
    pub async fn hybrid_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredKnowledge>> {
        let fetch = options.limit.saturating_mul(OVERFETCH);
        let embedding = self.embedder.embed(query).await?;
        let semantic = self.storage.search(&embedding, fetch, 0.0).await?;
        let keyword = self.keyword_search(query, fetch).await?;

        let mut fused: HashMap<String, ScoredKnowledge> = HashMap::new();
        for hit in semantic {
            let score = hit.score * SEMANTIC_WEIGHT;
            fused.insert(hit.item.id.clone(), ScoredKnowledge { score, ..hit });
        }
        for hit in keyword {
            let add = hit.score * KEYWORD_WEIGHT;
            fused
                .entry(hit.item.id.clone())
                .and_modify(|existing| existing.score += add)
                .or_insert(ScoredKnowledge {
                    score: add,
                    item: hit.item,
                });
        }
        debug!(candidates = fused.len(), "hybrid candidates");

        Ok(finish(fused.into_values().collect(), options, Utc::now()))
    }

    /// Items scored by the fraction of query words in their raw content, best first.
    pub async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredKnowledge>> {
        let words = query_words(query);
        let mut hits: Vec<ScoredKnowledge> = self
            .storage
            .all_knowledge()
            .await?
            .into_iter()
            .filter_map(|item| {
                let score = keyword_score(&words, &item.content.raw);
                (score > 0.0).then_some(ScoredKnowledge { item, score })
            })
            .collect();
        hits.sort_by(by_score_desc);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Nearest neighbours of a stored item, excluding the item itself.
    pub async fn get_similar(&self, id: &str, limit: usize) -> Result<Vec<ScoredKnowledge>> {
        let item = self
            .storage
            .get_knowledge(id)
            .await?
            .ok_or_else(|| StrataError::validation(format!("unknown knowledge item: {id}")))?;

        let mut results = self.storage.search(&item.embedding, limit.saturating_add(1), 0.0).await?;
        results.retain(|r| r.item.id != id);
        results.truncate(limit);
        Ok(results)
    }

    pub async fn get_by_topic(&self, topic: &str, limit: usize) -> Result<Vec<KnowledgeItem>> {
        let topic = topic.to_string();
        let items = self
            .storage
            .filter_knowledge(&move |item: &KnowledgeItem| item.has_topic(&topic))
            .await?;
        Ok(newest_first(items, limit))
    }

    pub async fn get_by_source(&self, source: &str, limit: usize) -> Result<Vec<KnowledgeItem>> {
        let source = source.to_string();
        let items = self
            .storage
            .filter_knowledge(&move |item: &KnowledgeItem| item.source.name == source)
            .await?;
        Ok(newest_first(items, limit))
    }

    pub async fn get_recent(&self, limit: usize) -> Result<Vec<KnowledgeItem>> {
        Ok(newest_first(self.storage.all_knowledge().await?, limit))
    }

    /// Highest importance first, newer first on ties.
    pub async fn get_important(&self, limit: usize) -> Result<Vec<KnowledgeItem>> {
        let mut items = self.storage.all_knowledge().await?;
        items.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        items.truncate(limit);
        Ok(items)
    }
}

fn newest_first(mut items: Vec<KnowledgeItem>, limit: usize) -> Vec<KnowledgeItem> {
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    items.truncate(limit);
    items
}

/// Filter, floor, optionally rerank, sort and truncate.
fn finish(
    candidates: Vec<ScoredKnowledge>,
    options: &SearchOptions,
    now: DateTime<Utc>,
) -> Vec<ScoredKnowledge> {
    let mut results: Vec<ScoredKnowledge> = candidates
        .into_iter()
        .filter(|r| options.filters.matches(&r.item))
        .filter(|r| r.score >= options.min_score)
        .collect();

    if options.rerank {
        for result in &mut results {
            result.score = rerank_score(result.score, &result.item, now);
        }
    }
    results.sort_by(by_score_desc);
    results.truncate(options.limit);
    results
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use strata_processing::Embedder;

    use crate::testing::{DIM, knowledge, storage};

    use super::*;

    async fn system() -> (RetrievalSystem, Arc<StorageOrchestrator>, Arc<Embedder>) {
        let storage = storage().await;
        let embedder = Arc::new(Embedder::local(DIM));
        (
            RetrievalSystem::new(storage.clone(), embedder.clone()),
            storage,
            embedder,
        )
    }

    #[test]
    fn recent_important_item_outranks_equal_base_score() {
        let now = Utc::now();
        let mut fresh = knowledge("fresh", "a", vec![1.0]);
        fresh.timestamp = now - ChronoDuration::hours(1);
        fresh.importance = 80.0;
        let mut stale = knowledge("stale", "b", vec![1.0]);
        stale.timestamp = now - ChronoDuration::hours(30);
        stale.importance = 40.0;

        assert!(rerank_score(0.5, &fresh, now) > rerank_score(0.5, &stale, now));
    }

    #[test]
    fn recency_boost_stops_at_one_day() {
        let now = Utc::now();
        let mut item = knowledge("x", "a", vec![1.0]);
        item.importance = 0.0;
        item.quality = 0.0;

        item.timestamp = now;
        assert!((rerank_score(1.0, &item, now) - 1.2).abs() < 1e-9);
        item.timestamp = now - ChronoDuration::hours(12);
        assert!((rerank_score(1.0, &item, now) - 1.1).abs() < 1e-6);
        item.timestamp = now - ChronoDuration::hours(25);
        assert_eq!(rerank_score(1.0, &item, now), 1.0);
    }

    #[test]
    fn boosts_compose_multiplicatively() {
        let now = Utc::now();
        let mut item = knowledge("x", "a", vec![1.0]);
        item.timestamp = now - ChronoDuration::days(3);
        item.importance = 100.0;
        item.quality = 100.0;
        assert!((rerank_score(1.0, &item, now) - 1.15 * 1.1).abs() < 1e-9);
    }

    #[test]
    fn keyword_score_is_matched_fraction() {
        let words = query_words("Solana airdrop SOLANA");
        assert_eq!(words, vec!["airdrop".to_string(), "solana".to_string()]);
        assert_eq!(keyword_score(&words, "Solana validators"), 0.5);
        assert_eq!(keyword_score(&words, "nothing here"), 0.0);
        assert_eq!(keyword_score(&[], "anything"), 0.0);
    }

    #[test]
    fn filters_combine() {
        let mut item = knowledge("x", "a", vec![1.0]);
        item.importance = 70.0;

        let mut filters = SearchFilters {
            sources: Some(vec!["hackernews".into()]),
            topics: Some(vec!["ai".into(), "crypto".into()]),
            min_importance: Some(60.0),
            ..Default::default()
        };
        assert!(filters.matches(&item));

        filters.since = Some(Utc::now() + ChronoDuration::hours(1));
        assert!(!filters.matches(&item));
        filters.since = None;
        filters.sources = Some(vec!["github".into()]);
        assert!(!filters.matches(&item));
    }

    #[tokio::test]
    async fn hybrid_search_fuses_semantic_and_keyword_scores() {
        let (retrieval, storage, embedder) = system().await;
        let query = "solana airdrop";
        storage
            .add_knowledge_batch(vec![
                knowledge(
                    "match",
                    "Solana airdrop opens for early users",
                    embedder.embed_one(query).await,
                ),
                knowledge(
                    "keyword-only",
                    "Solana fees drop again",
                    embedder.embed_one("completely unrelated text").await,
                ),
            ])
            .await
            .unwrap();

        let options = SearchOptions {
            limit: 5,
            rerank: false,
            ..Default::default()
        };
        let results = retrieval.hybrid_search(query, &options).await.unwrap();
        assert_eq!(results[0].item.id, "match");
        // 0.7 * 1.0 semantic + 0.3 * 1.0 keyword
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert!(results.iter().skip(1).all(|r| r.score < results[0].score));

        let reranked = retrieval
            .hybrid_search(query, &SearchOptions::with_limit(5))
            .await
            .unwrap();
        assert_eq!(reranked[0].item.id, "match");
    }

    #[tokio::test]
    async fn semantic_search_applies_min_score_and_limit() {
        let (retrieval, storage, embedder) = system().await;
        let mut items = Vec::new();
        for i in 0..5 {
            items.push(knowledge(
                &format!("same-{i}"),
                "rust release",
                embedder.embed_one("rust release").await,
            ));
        }
        items.push(knowledge(
            "other",
            "something else",
            embedder.embed_one("something else entirely").await,
        ));
        storage.add_knowledge_batch(items).await.unwrap();

        let options = SearchOptions {
            limit: 3,
            min_score: 0.9,
            ..Default::default()
        };
        let results = retrieval.search("rust release", &options).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.item.id.starts_with("same-")));
    }

    #[tokio::test]
    async fn unbounded_limits_return_everything() {
        let (retrieval, storage, embedder) = system().await;
        let v = embedder.embed_one("rust release").await;
        storage
            .add_knowledge_batch(vec![
                knowledge("a", "rust release", v.clone()),
                knowledge("b", "rust release notes", v),
            ])
            .await
            .unwrap();

        let options = SearchOptions {
            limit: usize::MAX,
            ..Default::default()
        };
        assert_eq!(retrieval.search("rust release", &options).await.unwrap().len(), 2);
        assert_eq!(retrieval.hybrid_search("rust release", &options).await.unwrap().len(), 2);
        assert_eq!(retrieval.get_similar("a", usize::MAX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn similar_excludes_the_item_itself() {
        let (retrieval, storage, embedder) = system().await;
        let v = embedder.embed_one("base").await;
        storage
            .add_knowledge_batch(vec![
                knowledge("a", "base", v.clone()),
                knowledge("b", "base twin", v),
            ])
            .await
            .unwrap();

        let similar = retrieval.get_similar("a", 5).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].item.id, "b");
        assert!(retrieval.get_similar("missing", 5).await.is_err());
    }

    #[tokio::test]
    async fn direct_views_sort_and_truncate() {
        let (retrieval, storage, _) = system().await;
        let now = Utc::now();
        let mut old = knowledge("old", "x", vec![1.0]);
        old.timestamp = now - ChronoDuration::hours(5);
        old.importance = 90.0;
        let mut new = knowledge("new", "y", vec![1.0]);
        new.timestamp = now;
        new.topics = ["ai".to_string()].into();
        new.source.name = "github".into();
        storage.add_knowledge_batch(vec![old, new]).await.unwrap();

        let recent = retrieval.get_recent(1).await.unwrap();
        assert_eq!(recent[0].id, "new");
        let important = retrieval.get_important(1).await.unwrap();
        assert_eq!(important[0].id, "old");
        let ai = retrieval.get_by_topic("ai", 10).await.unwrap();
        assert_eq!(ai.len(), 1);
        let github = retrieval.get_by_source("github", 10).await.unwrap();
        assert_eq!(github[0].id, "new");
    }
}
