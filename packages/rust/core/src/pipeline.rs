//! The composed knowledge pipeline: ingest → process → store, plus the
//! background learning and prediction-evaluation loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use strata_ingest::{
    BatchHandler, IngestOrchestrator, IngestStats, IngestSummary, Source, SourceRun, build_sources,
};
use strata_processing::{Embedder, ProcessingPipeline, ProcessingStats, TextAnalyzer, build_analyzer};
use strata_shared::{AppConfig, EventBus, PipelineEvent, RawItem, Result};
use strata_storage::{StorageOrchestrator, StorageStats};

use crate::learning::{LearningSummary, LearningSystem};
use crate::prediction::PredictionEngine;
use crate::retrieval::RetrievalSystem;

/// Everything `stats` reports, one section per stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub ingest: IngestStats,
    pub processing: ProcessingStats,
    pub storage: StorageStats,
    pub learning: LearningSummary,
}

/// Processes each fetched batch and writes it to storage.
struct StoreBatch {
    processing: Arc<ProcessingPipeline>,
    storage: Arc<StorageOrchestrator>,
    events: EventBus,
}

#[async_trait]
impl BatchHandler for StoreBatch {
    async fn handle_batch(&self, source: &str, items: Vec<RawItem>) {
        let knowledge = self.processing.process_batch(&items).await;
        if knowledge.is_empty() {
            return;
        }

        match self.storage.add_knowledge_batch(knowledge.clone()).await {
            Ok(stored) => {
                debug!(source, stored, "batch stored");
                for item in knowledge {
                    self.events
                        .publish(PipelineEvent::KnowledgeAdded(Box::new(item)));
                }
            }
            Err(e) => {
                warn!(source, error = %e, "failed to store batch");
                self.events.publish(PipelineEvent::Error {
                    source: source.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

struct BackgroundLoops {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Run `task` every `period` until `stopped` fires. Failures are logged and
/// the loop keeps going.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stopped: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = task().await {
                        warn!(task = name, error = %e, "background task failed");
                    }
                }
                _ = stopped.changed() => break,
            }
        }
        debug!(task = name, "background loop stopped");
    })
}

pub struct KnowledgePipeline {
    events: EventBus,
    ingest: Arc<IngestOrchestrator>,
    processing: Arc<ProcessingPipeline>,
    storage: Arc<StorageOrchestrator>,
    retrieval: Arc<RetrievalSystem>,
    learning: Arc<LearningSystem>,
    predictions: Arc<PredictionEngine>,
    sources: Vec<Arc<dyn Source>>,
    learning_interval: Duration,
    evaluation_interval: Duration,
    initialized: Mutex<bool>,
    loops: Mutex<Option<BackgroundLoops>>,
}

impl KnowledgePipeline {
    /// Wire the stages around already-built storage, processing and analyzer.
    pub fn new(
        config: &AppConfig,
        storage: Arc<StorageOrchestrator>,
        processing: Arc<ProcessingPipeline>,
        analyzer: Arc<dyn TextAnalyzer>,
        sources: Vec<Arc<dyn Source>>,
    ) -> Self {
        let events = EventBus::default();
        let ingest = Arc::new(IngestOrchestrator::new(&config.ingest, events.clone()));
        let retrieval = Arc::new(RetrievalSystem::new(
            storage.clone(),
            processing.embedder(),
        ));
        let learning = Arc::new(LearningSystem::new(storage.clone()).with_events(events.clone()));
        let predictions = Arc::new(
            PredictionEngine::new(storage.clone(), retrieval.clone(), learning.clone(), analyzer)
                .with_events(events.clone()),
        );

        Self {
            events,
            ingest,
            processing,
            storage,
            retrieval,
            learning,
            predictions,
            sources,
            learning_interval: Duration::from_secs(config.learning.interval_secs.max(1)),
            evaluation_interval: Duration::from_secs(config.prediction.interval_secs.max(1)),
            initialized: Mutex::new(false),
            loops: Mutex::new(None),
        }
    }

    /// Build every stage from config: sources, embedder, analyzer, backend.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let analyzer = build_analyzer(&config.analyzer)?;
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let processing = Arc::new(ProcessingPipeline::new(embedder, analyzer.clone()));
        let storage = Arc::new(StorageOrchestrator::from_config(config)?);
        let sources = build_sources(&config.sources)?;
        Ok(Self::new(config, storage, processing, analyzer, sources))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ingest(&self) -> &Arc<IngestOrchestrator> {
        &self.ingest
    }

    pub fn processing(&self) -> &Arc<ProcessingPipeline> {
        &self.processing
    }

    pub fn storage(&self) -> &Arc<StorageOrchestrator> {
        &self.storage
    }

    pub fn retrieval(&self) -> &Arc<RetrievalSystem> {
        &self.retrieval
    }

    pub fn learning(&self) -> &Arc<LearningSystem> {
        &self.learning
    }

    pub fn predictions(&self) -> &Arc<PredictionEngine> {
        &self.predictions
    }

    /// Open storage, register sources and install the batch handler. Idempotent.
    #[instrument(skip_all)]
    pub async fn init(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.storage.init().await?;
        self.ingest
            .set_handler(Arc::new(StoreBatch {
                processing: self.processing.clone(),
                storage: self.storage.clone(),
                events: self.events.clone(),
            }))
            .await;
        for source in &self.sources {
            self.ingest.register_source(source.clone()).await;
        }

        *initialized = true;
        info!(sources = self.sources.len(), "pipeline initialized");
        Ok(())
    }

    /// Start flushing, the background loops and scheduled ingestion.
    /// Returns the summary of the first full ingest pass.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<IngestSummary> {
        self.init().await?;
        self.storage.start_flush_loop().await;

        {
            let mut slot = self.loops.lock().await;
            if slot.is_some() {
                debug!("pipeline already running");
                return Ok(IngestSummary::default());
            }
            let (shutdown, stopped) = watch::channel(false);

            let learning = self.learning.clone();
            let learn = spawn_loop("learning", self.learning_interval, stopped.clone(), move || {
                let learning = learning.clone();
                async move { learning.analyze_patterns().await.map(|_| ()) }
            });

            let predictions = self.predictions.clone();
            let evaluate = spawn_loop(
                "evaluation",
                self.evaluation_interval,
                stopped,
                move || {
                    let predictions = predictions.clone();
                    async move { predictions.evaluate_predictions().await.map(|_| ()) }
                },
            );

            *slot = Some(BackgroundLoops {
                shutdown,
                handles: vec![learn, evaluate],
            });
        }

        info!(
            learning_secs = self.learning_interval.as_secs(),
            evaluation_secs = self.evaluation_interval.as_secs(),
            "pipeline started"
        );
        Ok(self.ingest.start().await)
    }

    /// Stop scheduling and the loops, then flush and release storage.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> Result<()> {
        self.ingest.stop().await;
        if let Some(loops) = self.loops.lock().await.take() {
            let _ = loops.shutdown.send(true);
            for handle in loops.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background loop ended abnormally");
                }
            }
        }
        self.storage.shutdown().await?;
        info!("pipeline stopped");
        Ok(())
    }

    pub async fn ingest_all(&self) -> Result<IngestSummary> {
        self.init().await?;
        Ok(self.ingest.ingest_all().await)
    }

    pub async fn ingest_source(&self, name: &str) -> Result<SourceRun> {
        self.init().await?;
        self.ingest.ingest_source(name).await
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            ingest: self.ingest.stats().await,
            processing: self.processing.stats(),
            storage: self.storage.stats().await?,
            learning: self.learning.summary().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use strata_processing::LocalAnalyzer;
    use strata_shared::{EventBusError, SourceType};
    use uuid::Uuid;

    use crate::testing::DIM;

    use super::*;

    struct StaticSource {
        name: String,
        posts: Vec<&'static str>,
    }

    #[async_trait]
    impl Source for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn source_type(&self) -> SourceType {
            SourceType::News
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn priority(&self) -> u8 {
            5
        }
        async fn fetch(&self) -> Result<Vec<RawItem>> {
            Ok(self
                .posts
                .iter()
                .enumerate()
                .map(|(i, text)| RawItem::new(&self.name, &i.to_string(), "post", *text, Utc::now()))
                .collect())
        }
    }

    fn pipeline(dir: &std::path::Path) -> KnowledgePipeline {
        let mut config = AppConfig::default();
        config.data.dir = dir.display().to_string();
        config.learning.interval_secs = 1;
        config.prediction.interval_secs = 1;

        let analyzer: Arc<dyn TextAnalyzer> = Arc::new(LocalAnalyzer::new());
        let processing = Arc::new(ProcessingPipeline::new(
            Arc::new(Embedder::local(DIM)),
            analyzer.clone(),
        ));
        let storage = Arc::new(StorageOrchestrator::new(
            Arc::new(strata_storage::LocalVectorStore::new(dir.join("vectors.json"))),
            Arc::new(strata_storage::MemoryStore::new(dir)),
            Duration::from_secs(3600),
        ));
        let source: Arc<dyn Source> = Arc::new(StaticSource {
            name: "hackernews".into(),
            posts: vec![
                "Solana airdrop announced for early users of the new bridge",
                "Rust 2024 edition ships with async closures",
                "Bitcoin ETF inflows hit a record high this week",
            ],
        });
        KnowledgePipeline::new(&config, storage, processing, analyzer, vec![source])
    }

    #[tokio::test]
    async fn ingested_items_are_processed_and_stored_once() {
        let dir = std::env::temp_dir().join(format!("strata-pipeline-{}", Uuid::now_v7()));
        let pipeline = pipeline(&dir);
        let mut rx = pipeline.events().subscribe();

        let summary = pipeline.ingest_all().await.unwrap();
        assert_eq!(summary.items, 3);
        assert_eq!(pipeline.storage().knowledge_count().await.unwrap(), 3);

        let mut added = 0;
        loop {
            match rx.try_recv() {
                Ok(PipelineEvent::KnowledgeAdded(_)) => added += 1,
                Ok(_) => {}
                Err(EventBusError::Empty) => break,
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(added, 3);

        pipeline.ingest_source("hackernews").await.unwrap();
        assert_eq!(pipeline.storage().knowledge_count().await.unwrap(), 3);

        let stats = pipeline.stats().await.unwrap();
        assert_eq!(stats.processing.processed, 6);
        assert_eq!(stats.storage.knowledge, 3);
        assert_eq!(stats.ingest.total_items, 6);

        let hits = pipeline
            .retrieval()
            .keyword_search("solana airdrop", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].item.content.raw.contains("Solana airdrop"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn start_and_stop_persist_state() {
        let dir = std::env::temp_dir().join(format!("strata-pipeline-{}", Uuid::now_v7()));
        let pipeline = pipeline(&dir);

        let summary = pipeline.start().await.unwrap();
        assert_eq!(summary.sources, 1);
        assert_eq!(pipeline.start().await.unwrap(), IngestSummary::default());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        pipeline.stop().await.unwrap();

        assert!(dir.join("vectors.json").exists());
        assert!(pipeline.learning().summary().await.unwrap().last_run.is_some());

        std::fs::remove_dir_all(&dir).ok();
    }
}
