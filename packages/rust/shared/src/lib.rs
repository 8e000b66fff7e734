//! Shared types, error model, configuration and events for strata.
//!
//! This crate is the foundation depended on by all other strata crates.
//! It provides:
//! - [`StrataError`]: the unified error type
//! - Domain types ([`RawItem`], [`KnowledgeItem`], [`Pattern`], [`Prediction`], ...)
//! - Configuration ([`AppConfig`], config loading)
//! - The [`EventBus`] carrying [`PipelineEvent`]s
//! - The [`EmbedText`] seam used by storage and retrieval

pub mod config;
pub mod embed;
pub mod error;
pub mod events;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalyzerConfig, AnalyzerProvider, AppConfig, DataConfig, EmbeddingConfig, EmbeddingProvider,
    GithubSourceConfig, HackerNewsSourceConfig, IngestConfig, LearningConfig, LibsqlConfig,
    PredictionConfig, QdrantConfig, RateLimitConfig, SourceConfig, StorageConfig,
    VectorBackendKind, WebPageSourceConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    require_env_key,
};
pub use embed::{EmbedText, cosine_similarity};
pub use error::{Result, StrataError};
pub use events::{EventBus, EventBusError, EventReceiver, PipelineEvent};
pub use types::{
    Condition, ConditionType, ContentType, Entity, EntityType, KnowledgeContent, KnowledgeItem,
    KnowledgeSource, MemoryEntry, Metadata, Operator, PREDICTION_TTL_HOURS, Pattern, Prediction,
    PredictionBasis, PredictionDetail, PredictionOutcome, PredictionType, RawItem, Relationship,
    ScoredKnowledge, SourceType, entity_id, raw_item_id,
};
