//! File-backed vector store: an in-memory index snapshotted to `vectors.json`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use strata_shared::{KnowledgeItem, Result, ScoredKnowledge, StrataError};

use super::cache::ItemCache;
use super::{ItemPredicate, VectorStore, WRITE_BATCH_SIZE};

pub struct LocalVectorStore {
    path: PathBuf,
    cache: ItemCache,
    dirty: AtomicBool,
}

impl LocalVectorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: ItemCache::new("local"),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unsaved writes are pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    async fn load(&self) -> Result<Vec<KnowledgeItem>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StrataError::io(&self.path, e)),
        };

        let records: Vec<Value> = serde_json::from_str(&text).map_err(|e| {
            StrataError::Serialization(format!("{}: {e}", self.path.display()))
        })?;

        let mut items = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<KnowledgeItem>(record) {
                Ok(item) => items.push(item),
                Err(e) => warn!(index, error = %e, "skipping undecodable knowledge record"),
            }
        }
        Ok(items)
    }
}

/// Write `bytes` next to `path` and rename over it.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StrataError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StrataError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StrataError::io(path, e))
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn init(&self) -> Result<()> {
        let _guard = self.cache.init_guard().await;
        if self.cache.is_initialized() {
            return Ok(());
        }

        let items = self.load().await?;
        info!(path = %self.path.display(), items = items.len(), "local vector store loaded");
        self.cache.insert_many(items).await;
        self.cache.mark_initialized();
        Ok(())
    }

    async fn add(&self, item: KnowledgeItem) -> Result<()> {
        self.cache.ensure_init()?;
        self.cache.insert(item).await;
        self.mark_dirty();
        Ok(())
    }

    async fn add_batch(&self, items: Vec<KnowledgeItem>) -> Result<usize> {
        self.cache.ensure_init()?;
        let count = items.len();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<KnowledgeItem> = items.by_ref().take(WRITE_BATCH_SIZE).collect();
            self.cache.insert_many(chunk).await;
        }
        if count > 0 {
            self.mark_dirty();
        }
        Ok(count)
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.get(id).await)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.cache.ensure_init()?;
        let existed = self.cache.remove(id).await;
        if existed {
            self.mark_dirty();
        }
        Ok(existed)
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredKnowledge>> {
        self.cache.ensure_init()?;
        Ok(self.cache.search(embedding, limit, min_score).await)
    }

    async fn filter(&self, predicate: ItemPredicate<'_>) -> Result<Vec<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.filter(predicate).await)
    }

    async fn get_all(&self) -> Result<Vec<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.all().await)
    }

    async fn count(&self) -> Result<usize> {
        self.cache.ensure_init()?;
        Ok(self.cache.len().await)
    }

    async fn save(&self) -> Result<()> {
        self.cache.ensure_init()?;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let items = self.cache.all().await;
        let result = async {
            let bytes = serde_json::to_vec_pretty(&items)?;
            write_atomic(&self.path, &bytes).await
        }
        .await;

        if let Err(e) = result {
            self.mark_dirty();
            return Err(e);
        }
        debug!(path = %self.path.display(), items = items.len(), "vectors saved");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cache.ensure_init()?;
        self.cache.clear().await;
        self.mark_dirty();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.cache.is_initialized() {
            return Ok(());
        }
        self.save().await
    }
}
