//! Domain logic on top of stored knowledge, and the composed pipeline.
//!
//! - [`RetrievalSystem`]: semantic, keyword and hybrid search with reranking
//! - [`LearningSystem`]: unsupervised pattern mining and matching
//! - [`PredictionEngine`]: expiring predictions and their evaluation
//! - [`KnowledgePipeline`]: ingest → process → store, with background loops

pub mod learning;
pub mod pipeline;
pub mod prediction;
pub mod retrieval;

#[cfg(test)]
mod testing;

pub use learning::{AnalysisReport, LearningSummary, LearningSystem, condition_holds, pattern_matches};
pub use pipeline::{KnowledgePipeline, PipelineStats};
pub use prediction::{Direction, Evaluation, PredictionEngine};
pub use retrieval::{RetrievalSystem, SearchFilters, SearchOptions, keyword_score, rerank_score};
