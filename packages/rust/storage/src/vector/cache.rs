//! In-process copy of full knowledge items keyed by id.
//!
//! The local backend uses it as its index. The remote backends keep it warm
//! so `get`, `filter` and `get_all` never need a round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock};

use strata_shared::{KnowledgeItem, Result, ScoredKnowledge, StrataError, cosine_similarity};

pub(crate) struct ItemCache {
    backend: &'static str,
    items: RwLock<HashMap<String, KnowledgeItem>>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl ItemCache {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            items: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Serializes concurrent `init` calls.
    pub(crate) async fn init_guard(&self) -> MutexGuard<'_, ()> {
        self.init_lock.lock().await
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_init(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StrataError::not_initialized(self.backend))
        }
    }

    pub(crate) async fn insert(&self, item: KnowledgeItem) {
        self.items.write().await.insert(item.id.clone(), item);
    }

    pub(crate) async fn insert_many(&self, items: impl IntoIterator<Item = KnowledgeItem>) {
        let mut map = self.items.write().await;
        for item in items {
            map.insert(item.id.clone(), item);
        }
    }

    pub(crate) async fn get(&self, id: &str) -> Option<KnowledgeItem> {
        self.items.read().await.get(id).cloned()
    }

    pub(crate) async fn remove(&self, id: &str) -> bool {
        self.items.write().await.remove(id).is_some()
    }

    pub(crate) async fn clear(&self) {
        self.items.write().await.clear();
    }

    pub(crate) async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Every item, ordered by id so snapshots are stable.
    pub(crate) async fn all(&self) -> Vec<KnowledgeItem> {
        let mut items: Vec<KnowledgeItem> = self.items.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub(crate) async fn filter(
        &self,
        predicate: &(dyn Fn(&KnowledgeItem) -> bool + Send + Sync),
    ) -> Vec<KnowledgeItem> {
        let mut items: Vec<KnowledgeItem> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| predicate(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Brute-force cosine search, best first.
    pub(crate) async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Vec<ScoredKnowledge> {
        let items = self.items.read().await;
        let mut scored: Vec<(f64, &KnowledgeItem)> = items
            .values()
            .map(|item| (cosine_similarity(embedding, &item.embedding), item))
            .filter(|(score, _)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        scored
            .into_iter()
            .take(limit)
            .map(|(score, item)| ScoredKnowledge {
                item: item.clone(),
                score,
            })
            .collect()
    }
}
