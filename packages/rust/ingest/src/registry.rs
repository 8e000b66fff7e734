//! Name-keyed registry of [`Source`]s.

use std::collections::HashMap;
use std::sync::Arc;

use strata_shared::SourceType;

use crate::source::Source;

/// Holds registered sources keyed by name.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning the one it replaced (same name), if any.
    pub fn register(&mut self, source: Arc<dyn Source>) -> Option<Arc<dyn Source>> {
        self.sources.insert(source.name().to_string(), source)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(name).cloned()
    }

    /// All sources, ordered by name.
    pub fn list(&self) -> Vec<Arc<dyn Source>> {
        let mut sources: Vec<_> = self.sources.values().cloned().collect();
        sources.sort_by(|a, b| a.name().cmp(b.name()));
        sources
    }

    /// Sources of one type, ordered by name.
    pub fn by_type(&self, source_type: SourceType) -> Vec<Arc<dyn Source>> {
        self.list()
            .into_iter()
            .filter(|s| s.source_type() == source_type)
            .collect()
    }

    /// All sources, highest priority first (ties by name).
    pub fn by_priority(&self) -> Vec<Arc<dyn Source>> {
        let mut sources = self.list();
        sources.sort_by(|a, b| b.priority().cmp(&a.priority()));
        sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use strata_shared::{RawItem, Result};

    use super::*;

    struct Named {
        name: &'static str,
        kind: SourceType,
        priority: u8,
    }

    #[async_trait]
    impl Source for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn source_type(&self) -> SourceType {
            self.kind
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }
        fn priority(&self) -> u8 {
            self.priority
        }
        async fn fetch(&self) -> Result<Vec<RawItem>> {
            Ok(vec![])
        }
    }

    fn registry() -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(Named {
            name: "hackernews",
            kind: SourceType::News,
            priority: 7,
        }));
        registry.register(Arc::new(Named {
            name: "github",
            kind: SourceType::Github,
            priority: 9,
        }));
        registry.register(Arc::new(Named {
            name: "blog",
            kind: SourceType::News,
            priority: 7,
        }));
        registry
    }

    #[test]
    fn orders_by_priority_then_name() {
        let names: Vec<String> = registry()
            .by_priority()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["github", "blog", "hackernews"]);
    }

    #[test]
    fn filters_by_type() {
        let news = registry().by_type(SourceType::News);
        assert_eq!(news.len(), 2);
        assert!(news.iter().all(|s| s.source_type() == SourceType::News));
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = registry();
        let replaced = registry.register(Arc::new(Named {
            name: "github",
            kind: SourceType::Github,
            priority: 1,
        }));
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("github").map(|s| s.priority()), Some(1));
        assert!(registry.get("missing").is_none());
    }
}
