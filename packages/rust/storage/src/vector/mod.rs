//! Semantic index over knowledge items.
//!
//! Three interchangeable backends implement [`VectorStore`]; which one is used
//! is decided once from `[storage] backend` by [`open_vector_store`].

mod cache;
pub mod libsql;
pub mod local;
pub mod qdrant;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use strata_shared::{
    AppConfig, EmbedText, KnowledgeItem, Result, ScoredKnowledge, VectorBackendKind,
};

pub use self::libsql::LibsqlVectorStore;
pub use self::local::LocalVectorStore;
pub use self::qdrant::QdrantVectorStore;

/// Records per backend write.
pub const WRITE_BATCH_SIZE: usize = 100;

/// Predicate accepted by [`VectorStore::filter`].
pub type ItemPredicate<'a> = &'a (dyn Fn(&KnowledgeItem) -> bool + Send + Sync);

/// Storage contract shared by every vector backend.
///
/// `init` must succeed before anything else; other methods fail with
/// `NotInitialized` until it has. `init` itself may be called repeatedly.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name (`local`, `qdrant`, `libsql`).
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    /// Insert or replace one item.
    async fn add(&self, item: KnowledgeItem) -> Result<()>;

    /// Insert or replace many items, written in chunks of [`WRITE_BATCH_SIZE`].
    async fn add_batch(&self, items: Vec<KnowledgeItem>) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<Option<KnowledgeItem>>;

    /// Returns whether the item existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Nearest items by cosine similarity, best first, each at least `min_score`.
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredKnowledge>>;

    /// Embed `query` and search with no score floor.
    async fn search_text(
        &self,
        query: &str,
        embedder: &dyn EmbedText,
        limit: usize,
    ) -> Result<Vec<ScoredKnowledge>> {
        let embedding = embedder.embed(query).await?;
        self.search(&embedding, limit, 0.0).await
    }

    async fn filter(&self, predicate: ItemPredicate<'_>) -> Result<Vec<KnowledgeItem>>;

    async fn get_all(&self) -> Result<Vec<KnowledgeItem>>;

    async fn count(&self) -> Result<usize>;

    /// Persist pending writes, if the backend buffers any.
    async fn save(&self) -> Result<()>;

    /// Remove every item.
    async fn clear(&self) -> Result<()>;

    /// Final save and release of connections.
    async fn shutdown(&self) -> Result<()>;
}

/// Build the backend selected in config. The store still needs `init`.
pub fn open_vector_store(config: &AppConfig) -> Result<Arc<dyn VectorStore>> {
    let data_dir = config.data_dir()?;
    let dimension = config.embedding.dimension;

    let store: Arc<dyn VectorStore> = match config.storage.backend {
        VectorBackendKind::Local => Arc::new(LocalVectorStore::new(data_dir.join("vectors.json"))),
        VectorBackendKind::Qdrant => {
            Arc::new(QdrantVectorStore::new(&config.storage.qdrant, dimension)?)
        }
        VectorBackendKind::Libsql => Arc::new(LibsqlVectorStore::new(
            &config.storage.libsql,
            &data_dir,
            dimension,
        )?),
    };
    info!(backend = store.name(), "vector store selected");
    Ok(store)
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use strata_shared::{ContentType, KnowledgeContent, KnowledgeSource, SourceType};

    use super::*;

    pub(crate) fn item(id: &str, embedding: Vec<f32>) -> KnowledgeItem {
        KnowledgeItem {
            id: id.to_string(),
            source: KnowledgeSource {
                kind: SourceType::News,
                name: "hackernews".into(),
                url: None,
                credibility: 70.0,
            },
            content: KnowledgeContent {
                raw: format!("item {id}"),
                summary: format!("item {id}"),
                kind: ContentType::Article,
            },
            embedding,
            entities: Vec::new(),
            relationships: Vec::new(),
            topics: ["general".to_string()].into(),
            sentiment: 0.0,
            importance: 50.0,
            timestamp: Utc::now(),
            expires_at: None,
            decay_rate: 0.5,
            processed: true,
            quality: 50.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use strata_shared::DataConfig;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn selects_backend_from_config() {
        let dir = std::env::temp_dir().join(format!("strata-open-{}", Uuid::now_v7()));
        let mut config = AppConfig {
            data: DataConfig {
                dir: dir.display().to_string(),
            },
            ..Default::default()
        };
        assert_eq!(open_vector_store(&config).unwrap().name(), "local");

        config.storage.backend = VectorBackendKind::Qdrant;
        assert_eq!(open_vector_store(&config).unwrap().name(), "qdrant");

        config.storage.backend = VectorBackendKind::Libsql;
        assert_eq!(open_vector_store(&config).unwrap().name(), "libsql");
    }
}
