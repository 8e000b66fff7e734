//! Prediction engine: derive expiring statements from knowledge and patterns,
//! then score them once they expire.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use strata_processing::TextAnalyzer;
use strata_processing::classifier::GENERAL_TOPIC;
use strata_shared::{
    EntityType, EventBus, KnowledgeItem, PipelineEvent, Prediction, PredictionBasis,
    PredictionDetail, PredictionOutcome, PredictionType, Result,
};
use strata_storage::StorageOrchestrator;

use crate::learning::{LearningSystem, pattern_matches};
use crate::retrieval::RetrievalSystem;

pub const MARKET_TOPIC: &str = "crypto";
const PRODUCT_TOPICS: &[&str] = &["development", "ai"];

/// Mean sentiment beyond which a market call is directional.
const DIRECTION_THRESHOLD: f64 = 0.2;
/// Items considered per prediction run.
const EVIDENCE_WINDOW: usize = 200;
/// Item ids recorded in a prediction's basis.
const BASIS_ITEMS: usize = 10;
/// Topics counted as "trending" when a content prediction is scored.
const TRENDING_TOPICS: usize = 5;
const CONTENT_LOOKBACK_HOURS: i64 = 24;

const AGENT_MIN_PATTERNS: usize = 5;
const AGENT_MIN_ACCURACY: f64 = 0.6;

const TIMEFRAME: &str = "24h";

const MARKET_SYSTEM_PROMPT: &str = "You are a cautious market analyst. Given recent \
news evidence, predict the 24h direction. Reply with a JSON object with keys: \
direction (bullish, bearish or neutral), outcome (one sentence), probability (0-1), \
confidence (0-100), reasoning (one or two sentences grounded in the evidence).";

/// Direction of a market call. Market outcomes start with this word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    pub fn from_sentiment(mean: f64) -> Self {
        if mean > DIRECTION_THRESHOLD {
            Self::Bullish
        } else if mean < -DIRECTION_THRESHOLD {
            Self::Bearish
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }

    /// Direction encoded at the start of a market outcome.
    fn of_outcome(outcome: &str) -> Option<Self> {
        outcome
            .split(|c: char| !c.is_alphabetic())
            .next()
            .and_then(|word| word.parse().ok())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" | "up" => Ok(Self::Bullish),
            "bearish" | "down" => Ok(Self::Bearish),
            "neutral" | "flat" => Ok(Self::Neutral),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HostedMarketCall {
    #[serde(default)]
    direction: Option<String>,
    outcome: String,
    probability: f64,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// Counts returned by [`PredictionEngine::evaluate_predictions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub evaluated: usize,
    pub correct: usize,
}

fn mean_sentiment(items: &[&KnowledgeItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    items.iter().map(|i| i.sentiment).sum::<f64>() / items.len() as f64
}

fn mentions(item: &KnowledgeItem, entity_id: &str) -> bool {
    item.entities.iter().any(|e| e.id == entity_id)
}

/// Top `n` keys by count, ties broken by key.
fn top_counts(counts: BTreeMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}

fn topic_counts<'a>(items: impl Iterator<Item = &'a KnowledgeItem>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        for topic in item.topics.iter().filter(|t| t.as_str() != GENERAL_TOPIC) {
            *counts.entry(topic.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Entity mention counts (once per item) for entities of `kind`, with display names.
fn entity_counts<'a>(
    items: impl Iterator<Item = &'a KnowledgeItem>,
    kind: EntityType,
) -> (BTreeMap<String, usize>, BTreeMap<String, String>) {
    let mut counts = BTreeMap::new();
    let mut names = BTreeMap::new();
    for item in items {
        let ids: BTreeSet<&str> = item
            .entities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| {
                names.entry(e.id.clone()).or_insert_with(|| e.name.clone());
                e.id.as_str()
            })
            .collect();
        for id in ids {
            *counts.entry(id.to_string()).or_insert(0) += 1;
        }
    }
    (counts, names)
}

fn basis_ids<'a>(items: impl Iterator<Item = &'a KnowledgeItem>) -> Vec<String> {
    items.take(BASIS_ITEMS).map(|i| i.id.clone()).collect()
}

pub struct PredictionEngine {
    storage: Arc<StorageOrchestrator>,
    retrieval: Arc<RetrievalSystem>,
    learning: Arc<LearningSystem>,
    analyzer: Arc<dyn TextAnalyzer>,
    events: Option<EventBus>,
}

impl PredictionEngine {
    pub fn new(
        storage: Arc<StorageOrchestrator>,
        retrieval: Arc<RetrievalSystem>,
        learning: Arc<LearningSystem>,
        analyzer: Arc<dyn TextAnalyzer>,
    ) -> Self {
        Self {
            storage,
            retrieval,
            learning,
            analyzer,
            events: None,
        }
    }

    /// Publish `prediction:made` for every stored prediction.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Make up to `count` predictions of `kind`, persist and publish them.
    #[instrument(skip(self))]
    pub async fn predict(&self, kind: PredictionType, count: usize) -> Result<Vec<Prediction>> {
        let count = count.max(1);
        let now = Utc::now();
        let predictions = match kind {
            PredictionType::Market => self.predict_market(count, now).await?,
            PredictionType::Content => self.predict_content(count, now).await?,
            PredictionType::Product => self.predict_product(count, now).await?,
            PredictionType::Agent => self.predict_agent(now).await?,
        };

        for prediction in &predictions {
            self.storage.save_prediction(prediction.clone()).await?;
            if let Some(events) = &self.events {
                events.publish(PipelineEvent::PredictionMade(Box::new(prediction.clone())));
            }
        }
        info!(made = predictions.len(), "predictions made");
        Ok(predictions)
    }

    pub async fn predictions(&self) -> Result<Vec<Prediction>> {
        self.storage.predictions().await
    }

    // -----------------------------------------------------------------------
    // Market
    // -----------------------------------------------------------------------

    async fn predict_market(&self, count: usize, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let items = self
            .retrieval
            .get_by_topic(MARKET_TOPIC, EVIDENCE_WINDOW)
            .await?;
        if items.is_empty() {
            debug!("no crypto knowledge, skipping market predictions");
            return Ok(Vec::new());
        }

        let (counts, names) = entity_counts(items.iter(), EntityType::Token);
        let mut subjects: Vec<Option<(String, String)>> = top_counts(counts, count)
            .into_iter()
            .map(|(id, _)| {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
                Some((id, name))
            })
            .collect();
        if subjects.is_empty() {
            subjects.push(None);
        }

        let patterns = self.learning.patterns().await?;
        let mut out = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let relevant: Vec<&KnowledgeItem> = match &subject {
                Some((id, _)) => items.iter().filter(|i| mentions(i, id)).collect(),
                None => items.iter().collect(),
            };
            let label = subject
                .as_ref()
                .map_or_else(|| "the crypto market".to_string(), |(_, name)| name.clone());

            let mut matched = BTreeSet::new();
            for item in &relevant {
                let value = serde_json::to_value(item)?;
                for pattern in patterns.iter().filter(|p| pattern_matches(p, &value)) {
                    matched.insert(pattern.id.clone());
                }
            }
            let basis = PredictionBasis {
                patterns: matched.into_iter().collect(),
                knowledge: basis_ids(relevant.iter().copied()),
                reasoning: String::new(),
            };

            let (detail, reasoning) = match self.hosted_market_call(&label, &relevant, &basis).await {
                Some(call) => call,
                None => Self::rule_market_call(&label, &relevant),
            };
            out.push(Prediction::new(
                PredictionType::Market,
                detail,
                PredictionBasis { reasoning, ..basis },
                subject.map(|(id, _)| id),
                now,
            ));
        }
        Ok(out)
    }

    fn rule_market_call(label: &str, items: &[&KnowledgeItem]) -> (PredictionDetail, String) {
        let mean = mean_sentiment(items);
        let direction = Direction::from_sentiment(mean);
        let probability = match direction {
            Direction::Neutral => 0.5,
            _ => (0.5 + mean.abs() / 2.0).min(0.95),
        };
        let detail = PredictionDetail {
            outcome: format!(
                "{}: {label} sentiment averages {mean:.2} across {} items",
                direction.as_str(),
                items.len()
            ),
            probability,
            confidence: (items.len() as f64 / 20.0).min(1.0) * 100.0,
            timeframe: TIMEFRAME.into(),
        };
        let reasoning = format!("mean sentiment {mean:.2} over {} crypto items", items.len());
        (detail, reasoning)
    }

    /// Ask the hosted analyzer for a market call. `None` means use the rules.
    async fn hosted_market_call(
        &self,
        label: &str,
        items: &[&KnowledgeItem],
        basis: &PredictionBasis,
    ) -> Option<(PredictionDetail, String)> {
        if !self.analyzer.is_hosted() {
            return None;
        }

        let mut prompt = format!(
            "Subject: {label}\nMean sentiment: {:.2} over {} items\nMatched patterns: {}\n\nEvidence:\n",
            mean_sentiment(items),
            items.len(),
            if basis.patterns.is_empty() {
                "none".to_string()
            } else {
                basis.patterns.join(", ")
            }
        );
        for item in items.iter().take(BASIS_ITEMS) {
            prompt.push_str(&format!(
                "- [{:+.2}] {}\n",
                item.sentiment, item.content.summary
            ));
        }

        let reply = match self
            .analyzer
            .complete_json(MARKET_SYSTEM_PROMPT, &prompt)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "hosted market call failed, using sentiment rules");
                return None;
            }
        };
        let call: HostedMarketCall = match serde_json::from_value(reply) {
            Ok(call) => call,
            Err(e) => {
                warn!(error = %e, "hosted market call malformed, using sentiment rules");
                return None;
            }
        };

        let direction = call
            .direction
            .as_deref()
            .and_then(|d| d.parse().ok())
            .or_else(|| Direction::of_outcome(&call.outcome))
            .unwrap_or_else(|| Direction::from_sentiment(mean_sentiment(items)));
        let detail = PredictionDetail {
            outcome: format!("{}: {}", direction.as_str(), call.outcome.trim()),
            probability: call.probability.clamp(0.0, 1.0),
            confidence: call.confidence.clamp(0.0, 100.0),
            timeframe: TIMEFRAME.into(),
        };
        Some((detail, call.reasoning))
    }

    // -----------------------------------------------------------------------
    // Content, product, agent
    // -----------------------------------------------------------------------

    async fn predict_content(&self, count: usize, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let since = now - Duration::hours(CONTENT_LOOKBACK_HOURS);
        let mut items = self
            .storage
            .filter_knowledge(&move |item: &KnowledgeItem| item.timestamp >= since)
            .await?;
        if items.is_empty() {
            items = self.retrieval.get_recent(EVIDENCE_WINDOW).await?;
        }
        let total = items.len().max(1) as f64;

        Ok(top_counts(topic_counts(items.iter()), count)
            .into_iter()
            .map(|(topic, n)| {
                let share = n as f64 / total;
                Prediction::new(
                    PredictionType::Content,
                    PredictionDetail {
                        outcome: format!("{topic} will keep trending"),
                        probability: (0.5 + share / 2.0).min(0.9),
                        confidence: (n as f64 * 10.0).min(100.0),
                        timeframe: TIMEFRAME.into(),
                    },
                    PredictionBasis {
                        patterns: Vec::new(),
                        knowledge: basis_ids(items.iter().filter(|i| i.has_topic(&topic))),
                        reasoning: format!("{n} of {} recent items are about {topic}", items.len()),
                    },
                    Some(topic),
                    now,
                )
            })
            .collect())
    }

    async fn predict_product(&self, count: usize, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let items = self
            .storage
            .filter_knowledge(&|item: &KnowledgeItem| {
                PRODUCT_TOPICS.iter().any(|t| item.has_topic(t))
            })
            .await?;

        let (counts, names) = entity_counts(items.iter(), EntityType::Technology);
        Ok(top_counts(counts, count)
            .into_iter()
            .map(|(id, n)| {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
                Prediction::new(
                    PredictionType::Product,
                    PredictionDetail {
                        outcome: format!("{name} will keep drawing attention from builders"),
                        probability: (0.5 + n as f64 / 20.0).min(0.9),
                        confidence: (n as f64 * 10.0).min(100.0),
                        timeframe: TIMEFRAME.into(),
                    },
                    PredictionBasis {
                        patterns: Vec::new(),
                        knowledge: basis_ids(items.iter().filter(|i| mentions(i, &id))),
                        reasoning: format!("{name} is mentioned in {n} development or AI items"),
                    },
                    Some(id),
                    now,
                )
            })
            .collect())
    }

    async fn predict_agent(&self, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let summary = self.learning.summary().await?;
        let patterns = self.learning.patterns().await?;
        let reliable =
            summary.patterns >= AGENT_MIN_PATTERNS && summary.average_accuracy >= AGENT_MIN_ACCURACY;

        let (outcome, probability) = if reliable {
            (
                format!(
                    "agents can act on {} learned patterns (average accuracy {:.2})",
                    summary.patterns, summary.average_accuracy
                ),
                summary.average_accuracy,
            )
        } else {
            (
                "pattern library is still maturing; agents should keep observing".to_string(),
                0.5,
            )
        };

        Ok(vec![Prediction::new(
            PredictionType::Agent,
            PredictionDetail {
                outcome,
                probability: probability.clamp(0.0, 1.0),
                confidence: summary.average_confidence * 100.0,
                timeframe: TIMEFRAME.into(),
            },
            PredictionBasis {
                patterns: patterns.into_iter().map(|p| p.id).collect(),
                knowledge: Vec::new(),
                reasoning: format!(
                    "{} patterns, average accuracy {:.2}, average confidence {:.2}",
                    summary.patterns, summary.average_accuracy, summary.average_confidence
                ),
            },
            None,
            now,
        )])
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Score every pending prediction past its expiry, exactly once.
    #[instrument(skip(self))]
    pub async fn evaluate_predictions(&self) -> Result<Evaluation> {
        let now = Utc::now();
        let due: Vec<Prediction> = self
            .storage
            .pending_predictions()
            .await?
            .into_iter()
            .filter(|p| p.is_due(now))
            .collect();
        if due.is_empty() {
            return Ok(Evaluation::default());
        }

        let knowledge = self.storage.all_knowledge().await?;
        let pattern_count = self.storage.patterns().await?.len();

        let mut result = Evaluation::default();
        for prediction in due {
            let since: Vec<&KnowledgeItem> = knowledge
                .iter()
                .filter(|i| i.timestamp >= prediction.made_at)
                .collect();
            let (correct, actual) = score(&prediction, &since, pattern_count);

            let outcome = PredictionOutcome {
                correct,
                actual,
                evaluated_at: now,
            };
            if !self.storage.record_outcome(&prediction.id, outcome).await? {
                debug!(id = %prediction.id, "prediction already evaluated");
                continue;
            }

            result.evaluated += 1;
            if correct {
                result.correct += 1;
            }
        }

        info!(evaluated = result.evaluated, correct = result.correct, "predictions evaluated");
        Ok(result)
    }
}

/// Judge one prediction against knowledge stored since it was made.
fn score(prediction: &Prediction, since: &[&KnowledgeItem], pattern_count: usize) -> (bool, String) {
    let subject = prediction.subject.as_deref();
    match prediction.kind {
        PredictionType::Market => {
            let relevant: Vec<&KnowledgeItem> = since
                .iter()
                .copied()
                .filter(|i| match subject {
                    Some(id) => mentions(i, id),
                    None => i.has_topic(MARKET_TOPIC),
                })
                .collect();
            if relevant.is_empty() {
                return (false, "no new evidence since the prediction".into());
            }
            let mean = mean_sentiment(&relevant);
            let actual = Direction::from_sentiment(mean);
            let predicted = Direction::of_outcome(&prediction.prediction.outcome);
            (
                predicted == Some(actual),
                format!(
                    "{}: sentiment averaged {mean:.2} across {} items",
                    actual.as_str(),
                    relevant.len()
                ),
            )
        }
        PredictionType::Content => {
            let trending: Vec<String> = top_counts(topic_counts(since.iter().copied()), TRENDING_TOPICS)
                .into_iter()
                .map(|(topic, _)| topic)
                .collect();
            let correct = subject.is_some_and(|s| trending.iter().any(|t| t == s));
            (correct, format!("trending topics: {}", trending.join(", ")))
        }
        PredictionType::Product => {
            let n = subject.map_or(0, |id| since.iter().filter(|i| mentions(i, id)).count());
            (n > 0, format!("mentioned in {n} new items"))
        }
        PredictionType::Agent => {
            let before = prediction.basis.patterns.len();
            (
                pattern_count >= before,
                format!("{pattern_count} patterns now, {before} at prediction time"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use strata_processing::{HostedAnalyzer, LocalAnalyzer};
    use strata_shared::{AnalyzerConfig, AnalyzerProvider, Entity};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::testing::{embedder, knowledge, storage};

    use super::*;

    fn sol_item(id: &str, sentiment: f64) -> KnowledgeItem {
        let mut item = knowledge(id, "Solana news", vec![1.0, 0.0]);
        item.sentiment = sentiment;
        item.entities = vec![Entity::new(EntityType::Token, "SOL")];
        item
    }

    async fn engine(analyzer: Arc<dyn TextAnalyzer>) -> (Arc<StorageOrchestrator>, PredictionEngine) {
        let storage = storage().await;
        let retrieval = Arc::new(RetrievalSystem::new(storage.clone(), embedder()));
        let learning = Arc::new(LearningSystem::new(storage.clone()));
        let engine = PredictionEngine::new(storage.clone(), retrieval, learning, analyzer);
        (storage, engine)
    }

    /// Rewind a stored prediction so it is already past its expiry.
    async fn make_due(storage: &StorageOrchestrator, mut prediction: Prediction) {
        prediction.made_at = Utc::now() - Duration::hours(25);
        prediction.expires_at = Utc::now() - Duration::hours(1);
        storage.save_prediction(prediction).await.unwrap();
    }

    #[tokio::test]
    async fn market_call_follows_sentiment_without_hosted_analyzer() {
        let (storage, engine) = engine(Arc::new(LocalAnalyzer::new())).await;
        storage
            .add_knowledge_batch(vec![sol_item("a", 0.6), sol_item("b", 0.4)])
            .await
            .unwrap();

        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let engine = engine.with_events(bus);

        let made = engine.predict(PredictionType::Market, 3).await.unwrap();
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].subject.as_deref(), Some("token:sol"));
        assert!(made[0].prediction.outcome.starts_with("bullish"));
        assert_eq!(made[0].expires_at - made[0].made_at, Duration::hours(24));
        assert_eq!(made[0].basis.knowledge.len(), 2);

        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::PredictionMade(_))));
        assert_eq!(engine.predictions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hosted_market_call_is_used_and_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content":
                    "{\"direction\": \"bearish\", \"outcome\": \"SOL retraces after the rally\", \"probability\": 0.65, \"confidence\": 55, \"reasoning\": \"overheated\"}"
                } }]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = AnalyzerConfig {
            provider: AnalyzerProvider::Openrouter,
            base_url: server.uri(),
            ..Default::default()
        };
        let analyzer = Arc::new(HostedAnalyzer::new(&config, "key".into()).unwrap());
        let (storage, engine) = engine(analyzer).await;
        storage
            .add_knowledge_batch(vec![sol_item("a", 0.7), sol_item("b", 0.5)])
            .await
            .unwrap();

        let hosted = engine.predict(PredictionType::Market, 1).await.unwrap();
        assert_eq!(hosted[0].prediction.outcome, "bearish: SOL retraces after the rally");
        assert_eq!(hosted[0].prediction.probability, 0.65);
        assert_eq!(hosted[0].basis.reasoning, "overheated");

        let fallback = engine.predict(PredictionType::Market, 1).await.unwrap();
        assert!(fallback[0].prediction.outcome.starts_with("bullish"));
    }

    #[tokio::test]
    async fn evaluation_waits_for_expiry_and_runs_once() {
        let (storage, engine) = engine(Arc::new(LocalAnalyzer::new())).await;
        let mut item = knowledge("old", "rust release", vec![1.0, 0.0]);
        item.topics = ["development".to_string()].into();
        storage.add_knowledge(item).await.unwrap();

        let made = engine.predict(PredictionType::Content, 1).await.unwrap();
        assert_eq!(made[0].subject.as_deref(), Some("development"));
        assert_eq!(engine.evaluate_predictions().await.unwrap(), Evaluation::default());

        make_due(&storage, made[0].clone()).await;
        let mut fresh = knowledge("new", "another rust release", vec![0.0, 1.0]);
        fresh.topics = ["development".to_string()].into();
        storage.add_knowledge(fresh).await.unwrap();

        let first = engine.evaluate_predictions().await.unwrap();
        assert_eq!(first, Evaluation { evaluated: 1, correct: 1 });
        let again = engine.evaluate_predictions().await.unwrap();
        assert_eq!(again.evaluated, 0);

        let stored = engine.predictions().await.unwrap();
        let outcome = stored[0].outcome.as_ref().expect("evaluated");
        assert!(outcome.correct);
    }

    #[tokio::test]
    async fn concurrent_evaluations_score_each_prediction_once() {
        let (storage, engine) = engine(Arc::new(LocalAnalyzer::new())).await;
        let mut item = knowledge("old", "rust release", vec![1.0, 0.0]);
        item.topics = ["development".to_string()].into();
        storage.add_knowledge(item).await.unwrap();

        let made = engine.predict(PredictionType::Content, 1).await.unwrap();
        make_due(&storage, made[0].clone()).await;

        let (a, b) = tokio::join!(engine.evaluate_predictions(), engine.evaluate_predictions());
        assert_eq!(a.unwrap().evaluated + b.unwrap().evaluated, 1);
        assert!(storage.pending_predictions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn product_and_agent_predictions() {
        let (storage, engine) = engine(Arc::new(LocalAnalyzer::new())).await;
        let items: Vec<KnowledgeItem> = (0..3)
            .map(|i| {
                let mut item = knowledge(&format!("p{i}"), "rust everywhere", vec![1.0, 0.0]);
                item.topics = ["ai".to_string()].into();
                item.entities = vec![Entity::new(EntityType::Technology, "Rust")];
                item
            })
            .collect();
        storage.add_knowledge_batch(items).await.unwrap();

        let product = engine.predict(PredictionType::Product, 2).await.unwrap();
        assert_eq!(product.len(), 1);
        assert_eq!(product[0].subject.as_deref(), Some("technology:rust"));

        let agent = engine.predict(PredictionType::Agent, 1).await.unwrap();
        assert_eq!(agent.len(), 1);
        assert!(agent[0].prediction.outcome.contains("maturing"));

        make_due(&storage, agent[0].clone()).await;
        let result = engine.evaluate_predictions().await.unwrap();
        assert_eq!(result, Evaluation { evaluated: 1, correct: 1 });
    }

    #[test]
    fn direction_thresholds() {
        assert_eq!(Direction::from_sentiment(0.21), Direction::Bullish);
        assert_eq!(Direction::from_sentiment(0.2), Direction::Neutral);
        assert_eq!(Direction::from_sentiment(-0.3), Direction::Bearish);
        assert_eq!(Direction::of_outcome("bearish: x"), Some(Direction::Bearish));
        assert_eq!(Direction::of_outcome("maybe"), None);
    }
}
