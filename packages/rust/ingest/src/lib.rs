//! Ingestion for strata.
//!
//! Sources are polled on independent schedules by the [`IngestOrchestrator`],
//! which keeps a ring buffer of recent raw items, publishes ingestion events
//! and hands every fetched batch to an optional [`BatchHandler`].

pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod sources;

pub use orchestrator::{
    BatchHandler, IngestOrchestrator, IngestStats, IngestSummary, SourceRun, SourceStats,
};
pub use registry::SourceRegistry;
pub use scheduler::{JobStatus, JobTask, RunOutcome, Schedule, Scheduler};
pub use source::{RateLimit, RateLimiter, Source};
pub use sources::{GithubSource, HackerNewsSource, WebPageSource, build_source, build_sources};
