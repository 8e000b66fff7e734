//! Entity extraction: hosted analyzer for long text, pattern rules otherwise.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use tracing::debug;

use strata_shared::{Entity, EntityType, Relationship};

use crate::analyzer::TextAnalyzer;
use crate::content_hash;

/// Text shorter than this never goes to the hosted analyzer.
pub const HOSTED_MIN_CHARS: usize = 200;

/// At most this many entities are kept per item.
pub const MAX_ENTITIES: usize = 20;

const CACHE_CAPACITY: usize = 10_000;

/// Relationship type linking entities mentioned in the same item.
pub const CO_MENTION: &str = "mentioned_with";

const KNOWN_TOKENS: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("ethereum", "ETH"),
    ("solana", "SOL"),
    ("cardano", "ADA"),
    ("dogecoin", "DOGE"),
    ("polkadot", "DOT"),
];

const KNOWN_TECHNOLOGIES: &[&str] = &[
    "Rust",
    "Python",
    "JavaScript",
    "TypeScript",
    "Kubernetes",
    "Docker",
    "PostgreSQL",
    "SQLite",
    "WebAssembly",
    "React",
    "Linux",
    "LLVM",
    "GraphQL",
    "Tokio",
    "PyTorch",
    "TensorFlow",
];

const KNOWN_COMPANIES: &[&str] = &[
    "OpenAI",
    "Anthropic",
    "Google",
    "Microsoft",
    "Apple",
    "Meta",
    "Amazon",
    "Nvidia",
    "Coinbase",
    "Binance",
    "GitHub",
    "Tesla",
    "Mozilla",
    "Cloudflare",
];

fn word_list_regex(words: &[&str]) -> Regex {
    let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!(r"(?i)\b({})\b", alternatives.join("|"))).expect("valid regex")
}

/// Rule-based extraction: `$TICKER`s, known token/technology/company names and `@handles`.
pub fn extract_rule_entities(text: &str) -> Vec<Entity> {
    static TICKER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$([A-Z]{2,10})\b").expect("valid regex"));
    static HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?:^|[^A-Za-z0-9_])@([A-Za-z0-9_]{2,30})").expect("valid regex")
    });
    static TOKEN_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
        let names: Vec<&str> = KNOWN_TOKENS.iter().map(|(name, _)| *name).collect();
        word_list_regex(&names)
    });
    static TECH_RE: LazyLock<Regex> = LazyLock::new(|| word_list_regex(KNOWN_TECHNOLOGIES));
    static COMPANY_RE: LazyLock<Regex> = LazyLock::new(|| word_list_regex(KNOWN_COMPANIES));

    let mut found = EntitySet::default();

    for cap in TICKER_RE.captures_iter(text) {
        found.add(Entity::new(EntityType::Token, &cap[1]), None);
    }
    for m in TOKEN_NAME_RE.find_iter(text) {
        let name = m.as_str().to_lowercase();
        if let Some((_, symbol)) = KNOWN_TOKENS.iter().find(|(n, _)| *n == name) {
            found.add(Entity::new(EntityType::Token, *symbol), Some(name));
        }
    }
    for m in TECH_RE.find_iter(text) {
        found.add(canonical(EntityType::Technology, KNOWN_TECHNOLOGIES, m.as_str()), None);
    }
    for m in COMPANY_RE.find_iter(text) {
        found.add(canonical(EntityType::Company, KNOWN_COMPANIES, m.as_str()), None);
    }
    for cap in HANDLE_RE.captures_iter(text) {
        let handle = &cap[1];
        found.add(
            Entity::new(EntityType::Person, handle),
            Some(format!("@{handle}")),
        );
    }

    found.into_vec()
}

/// The list spelling of a case-insensitive match.
fn canonical(kind: EntityType, list: &[&str], matched: &str) -> Entity {
    let name = list
        .iter()
        .find(|n| n.eq_ignore_ascii_case(matched))
        .copied()
        .unwrap_or(matched);
    Entity::new(kind, name)
}

/// Insertion-ordered entities deduplicated by id, aliases merged.
#[derive(Default)]
struct EntitySet {
    order: Vec<String>,
    by_id: HashMap<String, Entity>,
}

impl EntitySet {
    fn add(&mut self, entity: Entity, alias: Option<String>) {
        let slot = self.by_id.entry(entity.id.clone()).or_insert_with(|| {
            self.order.push(entity.id.clone());
            entity
        });
        if let Some(alias) = alias {
            if alias != slot.name {
                slot.aliases.insert(alias);
            }
        }
    }

    fn into_vec(mut self) -> Vec<Entity> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .take(MAX_ENTITIES)
            .collect()
    }
}

/// Pairwise co-mention relationships between the entities of one item.
pub fn co_mentions(entities: &[Entity], item_id: &str) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    for (i, a) in entities.iter().enumerate() {
        for b in &entities[i + 1..] {
            if a.id == b.id {
                continue;
            }
            relationships.push(Relationship {
                from: a.id.clone(),
                to: b.id.clone(),
                kind: CO_MENTION.to_string(),
                strength: 0.5,
                evidence: vec![item_id.to_string()],
            });
        }
    }
    relationships
}

/// Result of one extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    /// The hosted analyzer failed and rules were used instead.
    pub degraded: bool,
}

/// Cached entity extractor over a [`TextAnalyzer`].
pub struct EntityExtractor {
    analyzer: Arc<dyn TextAnalyzer>,
    cache: Mutex<HashMap<String, Vec<Entity>>>,
}

impl EntityExtractor {
    pub fn new(analyzer: Arc<dyn TextAnalyzer>) -> Self {
        Self {
            analyzer,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn extract(&self, text: &str) -> Extraction {
        let key = content_hash(text);
        if let Some(entities) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Extraction {
                entities: entities.clone(),
                degraded: false,
            };
        }

        let mut degraded = false;
        let entities = if text.len() < HOSTED_MIN_CHARS || !self.analyzer.is_hosted() {
            extract_rule_entities(text)
        } else {
            match self.analyzer.extract_entities(text).await {
                Ok(mut entities) => {
                    entities.truncate(MAX_ENTITIES);
                    entities
                }
                Err(e) => {
                    debug!(analyzer = self.analyzer.name(), error = %e, "entity extraction degraded to rules");
                    degraded = true;
                    extract_rule_entities(text)
                }
            }
        };

        // Degraded results are not cached so a recovered analyzer gets another try.
        if !degraded {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert(key, entities.clone());
        }

        Extraction { entities, degraded }
    }
}

#[cfg(test)]
mod tests {
    use crate::analyzer::LocalAnalyzer;

    use super::*;

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn extracts_tickers_names_and_handles() {
        let entities = extract_rule_entities(
            "$SOL rallies as Solana devs ship a Rust client; @aeyakovenko says OpenAI uses it",
        );
        let ids = ids(&entities);
        assert!(ids.contains(&"token:sol"));
        assert!(ids.contains(&"technology:rust"));
        assert!(ids.contains(&"company:openai"));
        assert!(ids.contains(&"person:aeyakovenko"));

        // `$SOL` and `Solana` are the same token.
        let sol: Vec<&Entity> = entities.iter().filter(|e| e.id == "token:sol").collect();
        assert_eq!(sol.len(), 1);
        assert!(sol[0].aliases.contains("solana"));
    }

    #[test]
    fn canonical_spelling_is_kept() {
        let entities = extract_rule_entities("we moved from javascript to TYPESCRIPT");
        let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["JavaScript", "TypeScript"]);
    }

    #[test]
    fn emails_are_not_handles() {
        let entities = extract_rule_entities("contact team@example.com for details");
        assert!(entities.iter().all(|e| e.kind != EntityType::Person));
    }

    #[test]
    fn co_mentions_link_each_pair_once() {
        let entities = vec![
            Entity::new(EntityType::Token, "SOL"),
            Entity::new(EntityType::Technology, "Rust"),
            Entity::new(EntityType::Company, "Coinbase"),
        ];
        let relationships = co_mentions(&entities, "item-1");
        assert_eq!(relationships.len(), 3);
        assert!(relationships.iter().all(|r| r.evidence == vec!["item-1"]));
        assert!(relationships.iter().all(|r| r.kind == CO_MENTION));
    }

    #[tokio::test]
    async fn local_analyzer_uses_rules_and_caches() {
        let extractor = EntityExtractor::new(Arc::new(LocalAnalyzer::new()));
        let first = extractor.extract("Nvidia and $ETH").await;
        let second = extractor.extract("Nvidia and $ETH").await;
        assert!(!first.degraded);
        assert_eq!(ids(&first.entities), ids(&second.entities));
        assert_eq!(first.entities.len(), 2);
    }
}
