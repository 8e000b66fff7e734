//! One storage API over the vector store and the memory store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use strata_shared::{
    AppConfig, EmbedText, KnowledgeItem, Pattern, Prediction, PredictionOutcome, Result,
    ScoredKnowledge,
};

use crate::memory::{MemoryStats, MemoryStore};
use crate::vector::{ItemPredicate, VectorStore, open_vector_store};

/// Counts reported by [`StorageOrchestrator::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub backend: String,
    pub knowledge: usize,
    #[serde(flatten)]
    pub memory: MemoryStats,
}

struct FlushLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct StorageOrchestrator {
    vectors: Arc<dyn VectorStore>,
    memory: Arc<MemoryStore>,
    flush_interval: Duration,
    flush_loop: Mutex<Option<FlushLoop>>,
}

impl StorageOrchestrator {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        memory: Arc<MemoryStore>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            vectors,
            memory,
            flush_interval,
            flush_loop: Mutex::new(None),
        }
    }

    /// Vector backend from `[storage]`, memory snapshots under the data dir.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let vectors = open_vector_store(config)?;
        let memory = Arc::new(MemoryStore::new(config.data_dir()?));
        Ok(Self::new(
            vectors,
            memory,
            Duration::from_secs(config.storage.flush_interval_secs.max(1)),
        ))
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub async fn init(&self) -> Result<()> {
        self.vectors.init().await?;
        self.memory.init().await
    }

    /// Spawn the periodic flush. A second call is a no-op.
    pub async fn start_flush_loop(&self) {
        let mut slot = self.flush_loop.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let vectors = self.vectors.clone();
        let memory = self.memory.clone();
        let period = self.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = flush_once(vectors.as_ref(), &memory).await {
                            warn!(error = %e, "periodic flush failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("flush loop stopped");
        });

        info!(interval_secs = period.as_secs(), "storage flush loop started");
        *slot = Some(FlushLoop { shutdown, handle });
    }

    /// Save both stores now.
    pub async fn flush(&self) -> Result<()> {
        flush_once(self.vectors.as_ref(), &self.memory).await
    }

    /// Stop the flush loop, flush once more and release the backend.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(flush_loop) = self.flush_loop.lock().await.take() {
            let _ = flush_loop.shutdown.send(true);
            if let Err(e) = flush_loop.handle.await {
                warn!(error = %e, "flush loop ended abnormally");
            }
        }
        self.vectors.save().await?;
        self.memory.save().await?;
        self.vectors.shutdown().await?;
        info!("storage shut down");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Knowledge
    // -----------------------------------------------------------------------

    pub async fn add_knowledge(&self, item: KnowledgeItem) -> Result<()> {
        self.vectors.add(item).await
    }

    pub async fn add_knowledge_batch(&self, items: Vec<KnowledgeItem>) -> Result<usize> {
        self.vectors.add_batch(items).await
    }

    pub async fn get_knowledge(&self, id: &str) -> Result<Option<KnowledgeItem>> {
        self.vectors.get(id).await
    }

    pub async fn delete_knowledge(&self, id: &str) -> Result<bool> {
        self.vectors.delete(id).await
    }

    pub async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredKnowledge>> {
        self.vectors.search(embedding, limit, min_score).await
    }

    pub async fn search_text(
        &self,
        query: &str,
        embedder: &dyn EmbedText,
        limit: usize,
    ) -> Result<Vec<ScoredKnowledge>> {
        self.vectors.search_text(query, embedder, limit).await
    }

    pub async fn filter_knowledge(&self, predicate: ItemPredicate<'_>) -> Result<Vec<KnowledgeItem>> {
        self.vectors.filter(predicate).await
    }

    pub async fn all_knowledge(&self) -> Result<Vec<KnowledgeItem>> {
        self.vectors.get_all().await
    }

    pub async fn knowledge_count(&self) -> Result<usize> {
        self.vectors.count().await
    }

    // -----------------------------------------------------------------------
    // Patterns and predictions
    // -----------------------------------------------------------------------

    pub async fn save_pattern(&self, pattern: Pattern) -> Result<Pattern> {
        self.memory.upsert_pattern(pattern).await
    }

    pub async fn patterns(&self) -> Result<Vec<Pattern>> {
        self.memory.patterns().await
    }

    pub async fn save_prediction(&self, prediction: Prediction) -> Result<()> {
        self.memory.save_prediction(prediction).await
    }

    pub async fn record_outcome(&self, id: &str, outcome: PredictionOutcome) -> Result<bool> {
        self.memory.record_outcome(id, outcome).await
    }

    pub async fn predictions(&self) -> Result<Vec<Prediction>> {
        self.memory.predictions().await
    }

    pub async fn pending_predictions(&self) -> Result<Vec<Prediction>> {
        self.memory.pending_predictions().await
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            backend: self.vectors.name().to_string(),
            knowledge: self.vectors.count().await?,
            memory: self.memory.stats().await?,
        })
    }
}

async fn flush_once(vectors: &dyn VectorStore, memory: &MemoryStore) -> Result<()> {
    vectors.save().await?;
    memory.save().await?;
    memory.compact().await?;
    Ok(())
}
