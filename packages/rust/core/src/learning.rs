//! Pattern mining over the whole knowledge base, and pattern matching.
//!
//! Three independent miners (entity co-occurrence, topic/sentiment
//! correlation, hour-of-day peaks) each produce patterns with stable ids, so a
//! re-discovery merges into the stored pattern instead of duplicating it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use strata_shared::{
    Condition, ConditionType, EventBus, KnowledgeItem, Operator, Pattern, PipelineEvent, Result,
};
use strata_storage::StorageOrchestrator;

pub const CO_OCCURRENCE_MIN: usize = 3;
const CO_OCCURRENCE_ACCURACY: f64 = 0.7;

pub const CORRELATION_MIN_ITEMS: usize = 5;
const CORRELATION_MAX_VARIANCE: f64 = 0.2;
const CORRELATION_MIN_MEAN: f64 = 0.3;

pub const TEMPORAL_MIN_COUNT: usize = 5;
const TEMPORAL_PEAK_FACTOR: f64 = 2.0;
const TEMPORAL_ACCURACY: f64 = 0.6;

#[allow(clippy::too_many_arguments)]
fn pattern(
    id: String,
    name: String,
    description: String,
    conditions: Vec<Condition>,
    occurrences: usize,
    accuracy: f64,
    confidence: f64,
    suggested_actions: Vec<String>,
    now: DateTime<Utc>,
) -> Pattern {
    Pattern {
        id,
        name,
        description,
        conditions,
        occurrences: occurrences as u64,
        accuracy: accuracy.clamp(0.0, 1.0),
        last_seen: now,
        suggested_actions,
        discovered: now,
        confidence: confidence.clamp(0.0, 1.0),
        evolving: false,
    }
}

// ---------------------------------------------------------------------------
// Miners
// ---------------------------------------------------------------------------

/// Entity pairs mentioned together in at least [`CO_OCCURRENCE_MIN`] items.
pub fn mine_co_occurrence(items: &[KnowledgeItem], now: DateTime<Utc>) -> Vec<Pattern> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut pairs: BTreeMap<(&str, &str), usize> = BTreeMap::new();

    for item in items {
        let ids: BTreeSet<&str> = item.entities.iter().map(|e| e.id.as_str()).collect();
        for entity in &item.entities {
            names.entry(entity.id.as_str()).or_insert(entity.name.as_str());
        }
        let ids: Vec<&str> = ids.into_iter().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                *pairs.entry((*a, *b)).or_insert(0) += 1;
            }
        }
    }

    pairs
        .into_iter()
        .filter(|(_, count)| *count >= CO_OCCURRENCE_MIN)
        .map(|((a, b), count)| {
            let name_a = names.get(a).copied().unwrap_or(a);
            let name_b = names.get(b).copied().unwrap_or(b);
            pattern(
                format!("cooc-{a}-{b}"),
                format!("{name_a} + {name_b}"),
                format!("{name_a} and {name_b} are mentioned together in {count} items"),
                vec![Condition {
                    kind: ConditionType::Correlation,
                    field: "entities.id".into(),
                    operator: Operator::Contains,
                    value: json!([a, b]),
                    timeframe: None,
                }],
                count,
                CO_OCCURRENCE_ACCURACY,
                count as f64 / 10.0,
                vec![format!("Watch for news linking {name_a} and {name_b}")],
                now,
            )
        })
        .collect()
}

/// Topics whose sentiment is consistently positive or negative.
pub fn mine_sentiment_correlation(items: &[KnowledgeItem], now: DateTime<Utc>) -> Vec<Pattern> {
    let mut by_topic: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for item in items {
        for topic in &item.topics {
            by_topic.entry(topic.as_str()).or_default().push(item.sentiment);
        }
    }

    by_topic
        .into_iter()
        .filter(|(_, sentiments)| sentiments.len() >= CORRELATION_MIN_ITEMS)
        .filter_map(|(topic, sentiments)| {
            let n = sentiments.len() as f64;
            let mean = sentiments.iter().sum::<f64>() / n;
            let variance = sentiments.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
            if variance >= CORRELATION_MAX_VARIANCE || mean.abs() <= CORRELATION_MIN_MEAN {
                return None;
            }

            let (direction, operator) = if mean > 0.0 {
                ("positive", Operator::Gt)
            } else {
                ("negative", Operator::Lt)
            };
            Some(pattern(
                format!("corr-sentiment-{topic}"),
                format!("{topic} sentiment is {direction}"),
                format!(
                    "{} {topic} items average sentiment {mean:.2} (variance {variance:.3})",
                    sentiments.len()
                ),
                vec![
                    Condition {
                        kind: ConditionType::Correlation,
                        field: "topics".into(),
                        operator: Operator::Contains,
                        value: json!(topic),
                        timeframe: None,
                    },
                    Condition {
                        kind: ConditionType::Threshold,
                        field: "sentiment".into(),
                        operator,
                        value: json!(0.0),
                        timeframe: None,
                    },
                ],
                sentiments.len(),
                1.0 - variance,
                n / 20.0,
                vec![format!("Expect {direction} coverage of {topic}")],
                now,
            ))
        })
        .collect()
}

/// Hours of the day at which a topic is posted far more than at its other hours.
///
/// The baseline is the mean count over the *other* hours that have any items
/// for the topic. Sparse topics with few such hours can over-report peaks.
pub fn mine_temporal(items: &[KnowledgeItem], now: DateTime<Utc>) -> Vec<Pattern> {
    let mut buckets: BTreeMap<&str, BTreeMap<u32, usize>> = BTreeMap::new();
    for item in items {
        let hour = item.timestamp.hour();
        for topic in &item.topics {
            *buckets
                .entry(topic.as_str())
                .or_default()
                .entry(hour)
                .or_insert(0) += 1;
        }
    }

    let mut patterns = Vec::new();
    for (topic, hours) in &buckets {
        for (&hour, &count) in hours {
            if count < TEMPORAL_MIN_COUNT {
                continue;
            }
            let others: Vec<usize> = hours
                .iter()
                .filter(|(h, _)| **h != hour)
                .map(|(_, c)| *c)
                .collect();
            let avg_other = if others.is_empty() {
                0.0
            } else {
                others.iter().sum::<usize>() as f64 / others.len() as f64
            };
            if (count as f64) <= TEMPORAL_PEAK_FACTOR * avg_other {
                continue;
            }
            let confidence = if avg_other > 0.0 {
                count as f64 / avg_other / 5.0
            } else {
                1.0
            };

            patterns.push(pattern(
                format!("temporal-{topic}-{hour:02}"),
                format!("{topic} peaks at {hour:02}:00"),
                format!(
                    "{count} {topic} items at {hour:02}:00 UTC against {avg_other:.1} at other hours"
                ),
                vec![
                    Condition {
                        kind: ConditionType::Sequence,
                        field: "topics".into(),
                        operator: Operator::Contains,
                        value: json!(topic),
                        timeframe: Some("1h".into()),
                    },
                    Condition {
                        kind: ConditionType::Threshold,
                        field: "timestamp".into(),
                        operator: Operator::Matches,
                        value: json!(format!("T{hour:02}:")),
                        timeframe: Some("1h".into()),
                    },
                ],
                count,
                TEMPORAL_ACCURACY,
                confidence,
                vec![format!("Schedule {topic} monitoring around {hour:02}:00 UTC")],
                now,
            ));
        }
    }
    patterns
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Follow a dotted path. Non-numeric segments map over arrays, flattening
/// one level, so `entities.id` yields every entity id.
fn lookup(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => lookup(map.get(*head)?, rest),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return lookup(items.get(index)?, rest);
            }
            let mut out = Vec::new();
            for found in items.iter().filter_map(|v| lookup(v, segments)) {
                match found {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Some(Value::Array(out))
        }
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), Value::Array(wanted)) => wanted
            .iter()
            .all(|w| items.iter().any(|i| values_equal(i, w))),
        (Value::Array(items), wanted) => items.iter().any(|i| values_equal(i, wanted)),
        (Value::String(text), Value::String(needle)) => {
            text.to_lowercase().contains(&needle.to_lowercase())
        }
        (Value::String(_), Value::Array(wanted)) => wanted.iter().all(|w| contains(actual, w)),
        _ => false,
    }
}

fn matches_regex(actual: &Value, expected: &Value) -> bool {
    let Some(Ok(re)) = expected.as_str().map(Regex::new) else {
        return false;
    };
    match actual {
        Value::String(s) => re.is_match(s),
        Value::Array(items) => items.iter().any(|v| v.as_str().is_some_and(|s| re.is_match(s))),
        other => re.is_match(&other.to_string()),
    }
}

/// Evaluate one condition against the JSON form of an item.
pub fn condition_holds(condition: &Condition, item: &Value) -> bool {
    let segments: Vec<&str> = condition.field.split('.').collect();
    let Some(actual) = lookup(item, &segments) else {
        return false;
    };
    let expected = &condition.value;
    match condition.operator {
        Operator::Gt => compare(&actual, expected) == Some(Ordering::Greater),
        Operator::Lt => compare(&actual, expected) == Some(Ordering::Less),
        Operator::Eq => values_equal(&actual, expected),
        Operator::Contains => contains(&actual, expected),
        Operator::Matches => matches_regex(&actual, expected),
    }
}

/// A pattern matches when every one of its conditions holds.
pub fn pattern_matches(pattern: &Pattern, item: &Value) -> bool {
    !pattern.conditions.is_empty() && pattern.conditions.iter().all(|c| condition_holds(c, item))
}

// ---------------------------------------------------------------------------
// Learning system
// ---------------------------------------------------------------------------

/// Result of one `analyze_patterns` run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub analyzed: usize,
    /// Stored patterns after merging this run's discoveries.
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningSummary {
    pub patterns: usize,
    pub average_accuracy: f64,
    pub average_confidence: f64,
    pub last_run: Option<DateTime<Utc>>,
}

pub struct LearningSystem {
    storage: Arc<StorageOrchestrator>,
    events: Option<EventBus>,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl LearningSystem {
    pub fn new(storage: Arc<StorageOrchestrator>) -> Self {
        Self {
            storage,
            events: None,
            last_run: Mutex::new(None),
        }
    }

    /// Publish `pattern:discovered` for every discovery.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[instrument(skip(self))]
    pub async fn analyze_patterns(&self) -> Result<AnalysisReport> {
        let items = self.storage.all_knowledge().await?;
        let now = Utc::now();

        let mut discovered = mine_co_occurrence(&items, now);
        discovered.extend(mine_sentiment_correlation(&items, now));
        discovered.extend(mine_temporal(&items, now));
        debug!(items = items.len(), discovered = discovered.len(), "miners finished");

        let mut patterns = Vec::with_capacity(discovered.len());
        for found in discovered {
            let stored = self.storage.save_pattern(found).await?;
            if let Some(events) = &self.events {
                events.publish(PipelineEvent::PatternDiscovered(Box::new(stored.clone())));
            }
            patterns.push(stored);
        }

        *self.last_run.lock().await = Some(now);
        info!(items = items.len(), patterns = patterns.len(), "pattern analysis complete");
        Ok(AnalysisReport {
            analyzed: items.len(),
            patterns,
        })
    }

    pub async fn patterns(&self) -> Result<Vec<Pattern>> {
        self.storage.patterns().await
    }

    /// Stored patterns whose conditions all hold for `item`.
    pub async fn match_patterns(&self, item: &KnowledgeItem) -> Result<Vec<Pattern>> {
        let value = serde_json::to_value(item)?;
        Ok(self
            .storage
            .patterns()
            .await?
            .into_iter()
            .filter(|p| pattern_matches(p, &value))
            .collect())
    }

    pub async fn summary(&self) -> Result<LearningSummary> {
        let patterns = self.storage.patterns().await?;
        let n = patterns.len();
        let (accuracy, confidence) = patterns
            .iter()
            .fold((0.0, 0.0), |(a, c), p| (a + p.accuracy, c + p.confidence));
        let average = |sum: f64| if n == 0 { 0.0 } else { sum / n as f64 };

        Ok(LearningSummary {
            patterns: n,
            average_accuracy: average(accuracy),
            average_confidence: average(confidence),
            last_run: *self.last_run.lock().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use strata_shared::{Entity, EntityType};

    use crate::testing::{knowledge, storage};

    use super::*;

    fn with_topics(id: &str, topics: &[&str], sentiment: f64) -> KnowledgeItem {
        let mut item = knowledge(id, "text", vec![1.0]);
        item.topics = topics.iter().map(|t| t.to_string()).collect();
        item.sentiment = sentiment;
        item
    }

    fn with_entities(id: &str, entities: &[(EntityType, &str)]) -> KnowledgeItem {
        let mut item = knowledge(id, "text", vec![1.0]);
        item.entities = entities
            .iter()
            .map(|(kind, name)| Entity::new(*kind, *name))
            .collect();
        item
    }

    #[tokio::test]
    async fn consistent_crypto_sentiment_yields_correlation_pattern() {
        let storage = storage().await;
        let sentiments = [0.6, 0.5, 0.55, 0.6, 0.5];
        let mut items: Vec<KnowledgeItem> = sentiments
            .iter()
            .enumerate()
            .map(|(i, s)| with_topics(&format!("c{i}"), &["crypto"], *s))
            .collect();
        items[4].topics.insert("security".into());
        storage.add_knowledge_batch(items).await.unwrap();

        let learning = LearningSystem::new(storage);
        let report = learning.analyze_patterns().await.unwrap();

        let mean = 0.55;
        let variance = sentiments.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / 5.0;
        let corr = report
            .patterns
            .iter()
            .find(|p| p.id == "corr-sentiment-crypto")
            .expect("correlation pattern");
        assert!((corr.accuracy - (1.0 - variance)).abs() < 1e-9);
        assert!((corr.confidence - 0.25).abs() < 1e-9);
        assert_eq!(corr.occurrences, 5);
        assert!(!report.patterns.iter().any(|p| p.id.contains("security")));
    }

    #[test]
    fn mixed_sentiment_is_not_a_correlation() {
        let items: Vec<KnowledgeItem> = [0.9, -0.9, 0.8, -0.7, 0.9]
            .iter()
            .enumerate()
            .map(|(i, s)| with_topics(&format!("m{i}"), &["ai"], *s))
            .collect();
        assert!(mine_sentiment_correlation(&items, Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn co_occurrence_merges_across_runs() {
        let storage = storage().await;
        let items: Vec<KnowledgeItem> = (0..3)
            .map(|i| {
                with_entities(
                    &format!("e{i}"),
                    &[(EntityType::Token, "SOL"), (EntityType::Technology, "Rust")],
                )
            })
            .collect();
        storage.add_knowledge_batch(items).await.unwrap();

        let learning = LearningSystem::new(storage);
        let id = "cooc-technology:rust-token:sol";

        let first = learning.analyze_patterns().await.unwrap();
        let p1 = first.patterns.iter().find(|p| p.id == id).unwrap().clone();
        assert_eq!(p1.occurrences, 3);
        assert!((p1.confidence - 0.3).abs() < 1e-9);
        assert_eq!(p1.accuracy, 0.7);

        let second = learning.analyze_patterns().await.unwrap();
        let p2 = second.patterns.iter().find(|p| p.id == id).unwrap();
        assert!(p2.occurrences >= p1.occurrences);
        assert_eq!(p2.occurrences, 6);
        assert_eq!(p2.discovered, p1.discovered);
    }

    #[test]
    fn temporal_peak_against_other_hours() {
        let at = |hour: u32, minute: u32| Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap();
        let mut items = Vec::new();
        for m in 0..6 {
            let mut item = with_topics(&format!("peak{m}"), &["ai"], 0.0);
            item.timestamp = at(14, m);
            items.push(item);
        }
        for hour in [2, 3, 4] {
            let mut item = with_topics(&format!("quiet{hour}"), &["ai"], 0.0);
            item.timestamp = at(hour, 0);
            items.push(item);
        }

        let patterns = mine_temporal(&items, Utc::now());
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].id, "temporal-ai-14");
        assert_eq!(patterns[0].accuracy, 0.6);
        assert_eq!(patterns[0].confidence, 1.0);

        let value = serde_json::to_value(&items[0]).unwrap();
        assert!(pattern_matches(&patterns[0], &value));
        let value = serde_json::to_value(&items[6]).unwrap();
        assert!(!pattern_matches(&patterns[0], &value));
    }

    #[tokio::test]
    async fn match_patterns_requires_every_condition() {
        let storage = storage().await;
        let items: Vec<KnowledgeItem> = (0..3)
            .map(|i| {
                with_entities(
                    &format!("e{i}"),
                    &[(EntityType::Token, "SOL"), (EntityType::Company, "Coinbase")],
                )
            })
            .collect();
        storage.add_knowledge_batch(items.clone()).await.unwrap();
        let learning = LearningSystem::new(storage);
        learning.analyze_patterns().await.unwrap();

        let matched = learning.match_patterns(&items[0]).await.unwrap();
        assert!(matched.iter().any(|p| p.id.starts_with("cooc-")));

        let partial = with_entities("p", &[(EntityType::Token, "SOL")]);
        let matched = learning.match_patterns(&partial).await.unwrap();
        assert!(!matched.iter().any(|p| p.id.starts_with("cooc-")));
    }

    #[test]
    fn condition_operators() {
        let mut item = with_topics("x", &["crypto", "ai"], 0.4);
        item.importance = 75.0;
        let value = serde_json::to_value(&item).unwrap();
        let cond = |field: &str, operator: Operator, v: Value| Condition {
            kind: ConditionType::Threshold,
            field: field.into(),
            operator,
            value: v,
            timeframe: None,
        };

        assert!(condition_holds(&cond("importance", Operator::Gt, json!(70)), &value));
        assert!(!condition_holds(&cond("importance", Operator::Lt, json!(70)), &value));
        assert!(condition_holds(&cond("content.type", Operator::Eq, json!("discussion")), &value));
        assert!(condition_holds(&cond("topics", Operator::Contains, json!(["ai", "crypto"])), &value));
        assert!(!condition_holds(&cond("topics", Operator::Contains, json!(["ai", "finance"])), &value));
        assert!(condition_holds(&cond("source.name", Operator::Matches, json!("^hacker")), &value));
        assert!(!condition_holds(&cond("source.name", Operator::Matches, json!("(")), &value));
        assert!(!condition_holds(&cond("missing.path", Operator::Eq, json!(1)), &value));
    }

    #[tokio::test]
    async fn summary_averages_stored_patterns() {
        let storage = storage().await;
        let learning = LearningSystem::new(storage);
        let empty = learning.summary().await.unwrap();
        assert_eq!(empty.patterns, 0);
        assert_eq!(empty.average_accuracy, 0.0);
        assert!(empty.last_run.is_none());
    }
}
