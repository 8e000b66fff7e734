//! Ingestion orchestrator: registry + scheduler + bounded fan-out.
//!
//! Fetch failures stop at the source boundary. They are counted in
//! [`IngestStats`] and published as [`PipelineEvent::Error`], never returned.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use strata_shared::{EventBus, IngestConfig, PipelineEvent, RawItem, Result, StrataError};

use crate::registry::SourceRegistry;
use crate::scheduler::{JobStatus, JobTask, Scheduler};
use crate::source::Source;

/// Receives every fetched batch, in order, without the lossy broadcast hop.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, source: &str, items: Vec<RawItem>);
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters for one source.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub items: u64,
    pub errors: u64,
    pub runs: u64,
    pub last_count: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Counters across all sources.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub total_items: u64,
    pub total_errors: u64,
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub sources: BTreeMap<String, SourceStats>,
}

/// Result of one `ingest_source` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRun {
    pub source: String,
    pub count: usize,
    pub error: Option<String>,
    /// A run of the same source was already in flight.
    pub skipped: bool,
}

/// Aggregate of one `ingest_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub sources: usize,
    pub items: usize,
    pub errors: usize,
    pub skipped: usize,
    pub runs: Vec<SourceRun>,
}

/// Removes the source from the in-flight set when the run ends.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    name: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a StdMutex<HashSet<String>>, name: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(name.to_string()).then(|| Self {
            set,
            name: name.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct IngestOrchestrator {
    registry: RwLock<SourceRegistry>,
    scheduler: Scheduler,
    events: EventBus,
    handler: RwLock<Option<Arc<dyn BatchHandler>>>,
    recent: Mutex<VecDeque<RawItem>>,
    buffer_capacity: usize,
    concurrency: usize,
    stats: Mutex<IngestStats>,
    in_flight: StdMutex<HashSet<String>>,
}

impl IngestOrchestrator {
    pub fn new(config: &IngestConfig, events: EventBus) -> Self {
        Self {
            registry: RwLock::new(SourceRegistry::new()),
            scheduler: Scheduler::new(),
            events,
            handler: RwLock::new(None),
            recent: Mutex::new(VecDeque::new()),
            buffer_capacity: config.buffer_capacity.max(1),
            concurrency: config.concurrency.max(1),
            stats: Mutex::new(IngestStats::default()),
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Install the consumer that receives every fetched batch.
    pub async fn set_handler(&self, handler: Arc<dyn BatchHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Register a source. Once started, its job is scheduled right away.
    pub async fn register_source(self: &Arc<Self>, source: Arc<dyn Source>) {
        let name = source.name().to_string();
        if self.registry.write().await.register(source.clone()).is_some() {
            warn!(source = %name, "replaced existing source");
        }
        if self.scheduler.is_started() {
            self.schedule_source(source.as_ref()).await;
        }
    }

    pub async fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.registry.read().await.list()
    }

    /// Schedule one job per source, start the scheduler and run one full ingest.
    #[instrument(skip_all)]
    pub async fn start(self: &Arc<Self>) -> IngestSummary {
        let sources = self.registry.read().await.list();
        for source in &sources {
            self.schedule_source(source.as_ref()).await;
        }
        self.scheduler.start().await;
        info!(sources = sources.len(), "ingestion started");

        self.ingest_all().await
    }

    /// Stop scheduling new runs. In-flight fetches finish on their own.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        info!("ingestion stopped");
    }

    pub async fn scheduled_jobs(&self) -> Vec<JobStatus> {
        self.scheduler.jobs().await
    }

    async fn schedule_source(self: &Arc<Self>, source: &dyn Source) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let name = source.name().to_string();
        let job_name = name.clone();

        let task: JobTask = Arc::new(move || {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = this.ingest_source(&name).await {
                    warn!(source = %name, error = %e, "scheduled ingest failed");
                }
            })
        });

        self.scheduler
            .schedule(job_name, source.interval(), task)
            .await;
    }

    /// Fetch one source and fan its items out.
    ///
    /// Only an unknown source name is an error; fetch failures are reported
    /// through the returned [`SourceRun`], the stats and an `error` event.
    #[instrument(skip(self))]
    pub async fn ingest_source(&self, name: &str) -> Result<SourceRun> {
        let source = self
            .registry
            .read()
            .await
            .get(name)
            .ok_or_else(|| StrataError::validation(format!("unknown source: {name}")))?;

        let Some(_in_flight) = InFlight::acquire(&self.in_flight, name) else {
            debug!(source = name, "source already running, skipping");
            return Ok(SourceRun {
                source: name.to_string(),
                count: 0,
                error: None,
                skipped: true,
            });
        };

        match source.fetch().await {
            Ok(mut items) => {
                let source_type = source.source_type();
                for item in &mut items {
                    item.source_type = source_type;
                }
                let count = items.len();
                self.remember(&items).await;
                self.record_success(name, count).await;

                for item in &items {
                    self.events
                        .publish(PipelineEvent::ItemIngested(Box::new(item.clone())));
                }

                let handler = self.handler.read().await.clone();
                if let Some(handler) = handler {
                    handler.handle_batch(name, items).await;
                }

                self.events.publish(PipelineEvent::BatchComplete {
                    source: name.to_string(),
                    count,
                });
                info!(source = name, count, "source ingested");

                Ok(SourceRun {
                    source: name.to_string(),
                    count,
                    error: None,
                    skipped: false,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(source = name, error = %message, "source fetch failed");
                self.record_failure(name, &message).await;
                self.events.publish(PipelineEvent::Error {
                    source: name.to_string(),
                    error: message.clone(),
                });

                Ok(SourceRun {
                    source: name.to_string(),
                    count: 0,
                    error: Some(message),
                    skipped: false,
                })
            }
        }
    }

    /// Fetch every source, highest priority first, `concurrency` at a time.
    #[instrument(skip_all)]
    pub async fn ingest_all(&self) -> IngestSummary {
        let names: Vec<String> = self
            .registry
            .read()
            .await
            .by_priority()
            .iter()
            .map(|s| s.name().to_string())
            .collect();

        let mut summary = IngestSummary {
            sources: names.len(),
            ..Default::default()
        };

        for chunk in names.chunks(self.concurrency) {
            let runs = join_all(chunk.iter().map(|name| self.ingest_source(name))).await;
            for run in runs.into_iter().flatten() {
                summary.items += run.count;
                if run.error.is_some() {
                    summary.errors += 1;
                }
                if run.skipped {
                    summary.skipped += 1;
                }
                summary.runs.push(run);
            }
        }

        info!(
            sources = summary.sources,
            items = summary.items,
            errors = summary.errors,
            "full ingest complete"
        );
        summary
    }

    /// Most recently ingested raw items, newest first.
    pub async fn recent_items(&self, limit: usize) -> Vec<RawItem> {
        self.recent
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> IngestStats {
        self.stats.lock().await.clone()
    }

    async fn remember(&self, items: &[RawItem]) {
        let mut recent = self.recent.lock().await;
        for item in items {
            if recent.len() == self.buffer_capacity {
                recent.pop_front();
            }
            recent.push_back(item.clone());
        }
    }

    async fn record_success(&self, name: &str, count: usize) {
        let now = Utc::now();
        let mut stats = self.stats.lock().await;
        stats.total_items += count as u64;
        stats.runs += 1;
        stats.last_run = Some(now);

        let source = stats.sources.entry(name.to_string()).or_default();
        source.items += count as u64;
        source.runs += 1;
        source.last_count = count;
        source.last_run = Some(now);
    }

    async fn record_failure(&self, name: &str, message: &str) {
        let now = Utc::now();
        let mut stats = self.stats.lock().await;
        stats.total_errors += 1;
        stats.runs += 1;
        stats.last_run = Some(now);

        let source = stats.sources.entry(name.to_string()).or_default();
        source.errors += 1;
        source.runs += 1;
        source.last_count = 0;
        source.last_run = Some(now);
        source.last_error = Some(message.to_string());
    }
}
