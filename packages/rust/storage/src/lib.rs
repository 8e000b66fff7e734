//! Knowledge storage for strata.
//!
//! - [`VectorStore`]: semantic index with `local`, `qdrant` and `libsql` backends
//! - [`MemoryStore`]: patterns, predictions and short/long-term key/value memory
//! - [`StorageOrchestrator`]: both behind one API, plus the periodic flush loop

pub mod memory;
mod migrations;
pub mod orchestrator;
pub mod vector;

pub use memory::{MemoryStats, MemoryStore};
pub use orchestrator::{StorageOrchestrator, StorageStats};
pub use vector::{
    ItemPredicate, LibsqlVectorStore, LocalVectorStore, QdrantVectorStore, VectorStore,
    WRITE_BATCH_SIZE, open_vector_store,
};
