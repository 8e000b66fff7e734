//! Core domain types for the strata knowledge pipeline.
//!
//! JSON field names are camelCase so that snapshots (`vectors.json`,
//! `patterns.json`, `predictions.json`) and pattern condition paths such as
//! `content.type` read the same way.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Namespace for deterministic raw item identifiers (UUID v5).
pub const RAW_ITEM_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4e8f_a1c7_52d0_e3b9_7f14);

/// Every prediction expires this many hours after it is made.
pub const PREDICTION_TTL_HOURS: i64 = 24;

/// Opaque key/value metadata attached to raw items and entities.
pub type Metadata = Map<String, Value>;

// ---------------------------------------------------------------------------
// RawItem
// ---------------------------------------------------------------------------

/// Derive the stable id of a raw item from its origin.
///
/// Re-ingesting the same external record always yields the same id, which
/// turns a second ingest into an upsert.
pub fn raw_item_id(source: &str, external_id: &str) -> String {
    Uuid::new_v5(
        &RAW_ITEM_NAMESPACE,
        format!("{source}:{external_id}").as_bytes(),
    )
    .to_string()
}

/// An unprocessed record fetched from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    pub id: String,
    /// Source name (e.g. `hackernews`).
    pub source: String,
    /// Source-specific record type (e.g. `story`, `release`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Declared type of the source that produced the item.
    #[serde(default)]
    pub source_type: SourceType,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl RawItem {
    /// Build a raw item whose id is derived from `(source, external_id)`.
    pub fn new(
        source: impl Into<String>,
        external_id: &str,
        kind: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let source = source.into();
        Self {
            id: raw_item_id(&source, external_id),
            source,
            kind: kind.into(),
            source_type: SourceType::default(),
            content: content.into(),
            metadata: Metadata::new(),
            timestamp,
        }
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Attach one metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Entities & relationships
// ---------------------------------------------------------------------------

/// Kind of a named entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Company,
    Token,
    Technology,
    Concept,
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Company => "company",
            Self::Token => "token",
            Self::Technology => "technology",
            Self::Concept => "concept",
            Self::Event => "event",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(Self::Person),
            "company" | "organization" => Ok(Self::Company),
            "token" | "crypto" => Ok(Self::Token),
            "technology" | "tech" => Ok(Self::Technology),
            "concept" => Ok(Self::Concept),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Stable entity id: `{type}:{lowercased name}`.
///
/// Two items mentioning the same entity share the id, which the
/// co-occurrence miner relies on.
pub fn entity_id(kind: EntityType, name: &str) -> String {
    format!("{}:{}", kind.as_str(), name.trim().to_lowercase())
}

/// A named thing mentioned in knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    pub name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub attributes: Metadata,
}

impl Entity {
    pub fn new(kind: EntityType, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: entity_id(kind, &name),
            kind,
            name,
            aliases: BTreeSet::new(),
            attributes: Metadata::new(),
        }
    }
}

/// A typed, weighted edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// In `[0, 1]`.
    pub strength: f64,
    /// Knowledge item ids supporting this relationship.
    #[serde(default)]
    pub evidence: Vec<String>,
}

// ---------------------------------------------------------------------------
// KnowledgeItem
// ---------------------------------------------------------------------------

/// Broad category of a knowledge source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Onchain,
    #[default]
    Social,
    News,
    Github,
    Research,
    Market,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onchain => "onchain",
            Self::Social => "social",
            Self::News => "news",
            Self::Github => "github",
            Self::Research => "research",
            Self::Market => "market",
        }
    }
}

/// Shape of the content carried by a knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Article,
    Post,
    Discussion,
    Code,
    Release,
    Transaction,
    Paper,
    Price,
}

/// Where a knowledge item came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSource {
    #[serde(rename = "type")]
    pub kind: SourceType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// In `[0, 100]`.
    pub credibility: f64,
}

/// Raw text plus its summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeContent {
    pub raw: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
}

/// The durable, searchable unit produced from exactly one raw item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    pub id: String,
    pub source: KnowledgeSource,
    pub content: KnowledgeContent,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    /// In `[-1, 1]`.
    pub sentiment: f64,
    /// In `[0, 100]`.
    pub importance: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// In `[0, 1]`.
    pub decay_rate: f64,
    pub processed: bool,
    /// In `[0, 100]`.
    pub quality: f64,
}

impl KnowledgeItem {
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Milliseconds between the item timestamp and `now` (negative if in the future).
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }
}

/// A knowledge item annotated with a similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredKnowledge {
    #[serde(flatten)]
    pub item: KnowledgeItem,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// How a condition relates to the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    Threshold,
    Sequence,
    Correlation,
    Absence,
}

/// Comparison applied by a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "matches")]
    Matches,
}

/// One predicate over a knowledge item, addressed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// Dotted path into the JSON form of a knowledge item (e.g. `entities.id`).
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
}

/// A statistically discovered rule over the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub description: String,
    pub conditions: Vec<Condition>,
    pub occurrences: u64,
    /// In `[0, 1]`.
    pub accuracy: f64,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    pub discovered: DateTime<Utc>,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub evolving: bool,
}

impl Pattern {
    /// Fold a re-discovery of the same pattern into this one.
    ///
    /// Occurrences accumulate, confidence is averaged and `last_seen` moves
    /// forward; the original discovery time is kept.
    pub fn merge(&mut self, rediscovered: &Pattern) {
        self.occurrences = self.occurrences.saturating_add(rediscovered.occurrences);
        self.confidence = ((self.confidence + rediscovered.confidence) / 2.0).clamp(0.0, 1.0);
        if rediscovered.last_seen > self.last_seen {
            self.last_seen = rediscovered.last_seen;
        }
        self.accuracy = rediscovered.accuracy;
        self.description = rediscovered.description.clone();
        self.conditions = rediscovered.conditions.clone();
        self.evolving = true;
    }
}

// ---------------------------------------------------------------------------
// Predictions
// ---------------------------------------------------------------------------

/// Domain a prediction is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionType {
    Market,
    Content,
    Product,
    Agent,
}

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Content => "content",
            Self::Product => "product",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for PredictionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PredictionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "content" => Ok(Self::Content),
            "product" => Ok(Self::Product),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown prediction type: {other}")),
        }
    }
}

/// The falsifiable statement itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionDetail {
    pub outcome: String,
    /// In `[0, 1]`.
    pub probability: f64,
    /// In `[0, 100]`.
    pub confidence: f64,
    pub timeframe: String,
}

/// Evidence a prediction was derived from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionBasis {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub knowledge: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Result of scoring a prediction after it expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionOutcome {
    pub correct: bool,
    pub actual: String,
    pub evaluated_at: DateTime<Utc>,
}

/// A timestamped, expiring statement derived from knowledge and patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PredictionType,
    pub prediction: PredictionDetail,
    pub basis: PredictionBasis,
    /// Token, topic or technology the statement is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub made_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PredictionOutcome>,
}

impl Prediction {
    /// Create a pending prediction expiring [`PREDICTION_TTL_HOURS`] after `made_at`.
    pub fn new(
        kind: PredictionType,
        prediction: PredictionDetail,
        basis: PredictionBasis,
        subject: Option<String>,
        made_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            prediction,
            basis,
            subject,
            made_at,
            expires_at: made_at + Duration::hours(PREDICTION_TTL_HOURS),
            outcome: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    /// Pending and past its expiry.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// Memory entries
// ---------------------------------------------------------------------------

/// A short-term (with `ttl_ms`) or long-term (without) memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl MemoryEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => (now - self.created_at).num_milliseconds() > ttl as i64,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_item_id_is_deterministic() {
        let a = raw_item_id("hackernews", "4242");
        let b = raw_item_id("hackernews", "4242");
        let c = raw_item_id("github", "4242");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn entity_ids_ignore_case() {
        let a = Entity::new(EntityType::Token, "SOL");
        let b = Entity::new(EntityType::Token, "sol");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, "token:sol");
    }

    #[test]
    fn pattern_merge_accumulates() {
        let now = Utc::now();
        let base = Pattern {
            id: "p".into(),
            name: "p".into(),
            description: "first".into(),
            conditions: vec![],
            occurrences: 3,
            accuracy: 0.7,
            last_seen: now,
            suggested_actions: vec![],
            discovered: now,
            confidence: 0.4,
            evolving: false,
        };
        let mut merged = base.clone();
        let again = Pattern {
            occurrences: 5,
            confidence: 0.8,
            last_seen: now + Duration::minutes(5),
            discovered: now + Duration::minutes(5),
            ..base.clone()
        };
        merged.merge(&again);

        assert_eq!(merged.occurrences, 8);
        assert!((merged.confidence - 0.6).abs() < 1e-9);
        assert_eq!(merged.last_seen, again.last_seen);
        assert_eq!(merged.discovered, base.discovered);
        assert!(merged.evolving);
    }

    #[test]
    fn prediction_due_only_after_expiry() {
        let made_at = Utc::now() - Duration::hours(1);
        let p = Prediction::new(
            PredictionType::Content,
            PredictionDetail {
                outcome: "x".into(),
                probability: 0.6,
                confidence: 50.0,
                timeframe: "24h".into(),
            },
            PredictionBasis::default(),
            None,
            made_at,
        );
        assert!(!p.is_due(Utc::now()));
        assert!(p.is_due(made_at + Duration::hours(PREDICTION_TTL_HOURS)));
    }

    #[test]
    fn knowledge_item_json_uses_camel_case() {
        let item = KnowledgeItem {
            id: "k".into(),
            source: KnowledgeSource {
                kind: SourceType::News,
                name: "hackernews".into(),
                url: None,
                credibility: 70.0,
            },
            content: KnowledgeContent {
                raw: "raw".into(),
                summary: "raw".into(),
                kind: ContentType::Discussion,
            },
            embedding: vec![1.0],
            entities: vec![],
            relationships: vec![],
            topics: BTreeSet::new(),
            sentiment: 0.0,
            importance: 50.0,
            timestamp: Utc::now(),
            expires_at: None,
            decay_rate: 0.5,
            processed: true,
            quality: 40.0,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["decayRate"], 0.5);
        assert_eq!(json["content"]["type"], "discussion");
        assert_eq!(json["source"]["type"], "news");
    }
}
